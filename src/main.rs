use crema_rs::config::ControlConfig;
use crema_rs::controller::{CommandChannel, EspressoController, SensorChannel};
use crema_rs::types::{Command, SensorEvent, SystemState};
use embassy_executor::Spawner;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use embassy_time::{Duration, Instant, Timer};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::init();

    info!("Starting espresso process controller");

    let config = match std::env::args().nth(1) {
        Some(path) => match ControlConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(err) => {
                warn!("{:#}; using default configuration", err);
                ControlConfig::default()
            }
        },
        None => ControlConfig::default(),
    };

    let mut controller = EspressoController::new(&config);

    // Without real hardware the binary runs against a simulated machine
    // and pulls one scripted shot through the configured profile.
    spawner
        .spawn(simulator_task(
            controller.sensor_channel(),
            controller.state_manager().get_state_handle(),
        ))
        .unwrap();
    spawner.spawn(demo_task(controller.command_channel())).unwrap();

    controller.run().await
}

/// A crude single-boiler machine: first-order boiler thermals, a pump
/// working into a puck with some compliance, and a scale catching 90%
/// of what flows. Reads the commanded actuators from the published
/// state, closing the loop the way the real sensors would.
#[embassy_executor::task]
async fn simulator_task(
    sensors: Arc<SensorChannel>,
    state: Arc<Mutex<CriticalSectionRawMutex, SystemState>>,
) {
    const TAU_BOILER: f64 = 3500.0;
    const K_BOILER: f64 = 450.0;
    const T_AMBIENT: f64 = 20.0;

    let mut temperature = T_AMBIENT;
    let mut pressure = 0.0;
    let mut mass = 0.0;
    let dt = 0.1;

    loop {
        Timer::after(Duration::from_millis(100)).await;

        let (pump, heat) = {
            let s = state.lock().await;
            (nan_to_zero(s.pump_flow), nan_to_zero(s.heat_power))
        };

        temperature += (K_BOILER * heat - (temperature - T_AMBIENT)) * dt / TAU_BOILER;
        pressure += (9.0 * pump - pressure) * dt / 0.4;
        let flow = pressure / 3.0;
        mass += 0.9 * flow * dt;

        let t = Instant::now().as_micros() as f64 / 1e6;
        sensors
            .send(SensorEvent::Temperature { celsius: temperature, t })
            .await;
        sensors.send(SensorEvent::Pressure { bar: pressure, t }).await;
        if flow > 0.05 {
            sensors.send(SensorEvent::Flow { rate: flow, t }).await;
        } else {
            sensors.send(SensorEvent::FlowStagnated { t }).await;
        }
        sensors.send(SensorEvent::Mass { grams: mass, t }).await;
    }
}

#[embassy_executor::task]
async fn demo_task(commands: Arc<CommandChannel>) {
    // Let the filters settle on the simulated sensors first.
    Timer::after(Duration::from_secs(2)).await;

    info!("Pulling demo shot");
    commands.send(Command::LogShot { lines: 400 }).await;
    commands.send(Command::BrewSwitch(true)).await;

    Timer::after(Duration::from_secs(45)).await;
    commands.send(Command::BrewSwitch(false)).await;
    commands.send(Command::PrintProfile).await;
    info!("Demo shot complete");
}

fn nan_to_zero(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}
