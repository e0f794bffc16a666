use crate::types::{ControlMode, SystemState, LOG_CAPACITY};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use log::info;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Shared, published view of the system for UI and logging consumers.
/// The controller owns the live machine; everything observable lands
/// here as a snapshot once per tick or on a notable change.
pub struct StateManager {
    state: Arc<Mutex<CriticalSectionRawMutex, SystemState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SystemState::default())),
        }
    }

    pub fn get_state_handle(&self) -> Arc<Mutex<CriticalSectionRawMutex, SystemState>> {
        Arc::clone(&self.state)
    }

    /// Overwrite the measurement and setpoint fields wholesale. Log
    /// messages and last_error are preserved; they only change through
    /// their own paths.
    pub async fn publish(&self, snapshot: SystemState) {
        let mut state = self.state.lock().await;
        let log_messages = core::mem::take(&mut state.log_messages);
        let last_error = state.last_error.take();

        *state = snapshot;
        state.log_messages = log_messages;
        state.last_error = last_error;
    }

    pub async fn set_mode(&self, mode: ControlMode) {
        let mut state = self.state.lock().await;
        if state.mode != mode {
            info!("Mode changed: {:?} -> {:?}", state.mode, mode);
            state.mode = mode;
            self.add_log_message(&mut state, format!("Mode: {:?}", mode));
        }
    }

    pub async fn set_error(&self, error: Option<String>) {
        let mut state = self.state.lock().await;
        state.last_error = error.clone();
        if let Some(err) = error {
            self.add_log_message(&mut state, format!("ERROR: {}", err));
        }
    }

    pub async fn add_log(&self, message: String) {
        let mut state = self.state.lock().await;
        self.add_log_message(&mut state, message);
    }

    fn add_log_message(&self, state: &mut SystemState, message: String) {
        // Monotonic counter instead of a timestamp, so entries order
        // correctly even before the clock is meaningful.
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let log_entry = format!("[{}] {}", count, message);

        if state.log_messages.len() >= LOG_CAPACITY {
            state.log_messages.remove(0);
        }

        let _ = state.log_messages.push(log_entry);
    }

    pub async fn get_mode(&self) -> ControlMode {
        let state = self.state.lock().await;
        state.mode
    }

    pub async fn get_shot_time(&self) -> f64 {
        let state = self.state.lock().await;
        state.shot_time
    }

    pub async fn get_full_state(&self) -> SystemState {
        let state = self.state.lock().await;
        state.clone()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
