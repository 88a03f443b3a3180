use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use quadpilot::config;
use quadpilot::control::mma::{Mma, MotorLin};
use quadpilot::control::{self, ControlConfig, Supervisor};
use quadpilot::ekf::{self, EkfTuning};
use quadpilot::meas::{self, CalibrationConfig};
use quadpilot::rc::{self, CH_PITCH, CH_ROLL, CH_SWA, CH_YAW};
use quadpilot::sensors::{ChannelRc, MockMotors, RcFeed, ReplaySensors, SensorClient};
use quadpilot::types::RcFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ControlMode {
    /// Wait for a pilot on the RC link.
    Rc,
    /// Arm and start the mission script without a pilot.
    Auto,
}

#[derive(Parser, Debug)]
#[command(name = "quadpilot", about = "Quadrotor state-estimation and flight-control core")]
struct Args {
    /// Initial control mode
    #[arg(short = 'c', value_enum, default_value = "rc")]
    control: ControlMode,

    /// Vehicle configuration file (@PID/@THROTTLE/@ATTENUATION sections)
    #[arg(long, default_value = "/etc/quad.conf")]
    config: PathBuf,

    /// Mission script (@flight_mode sections)
    #[arg(long, default_value = "/etc/q_mission.conf")]
    mission: PathBuf,

    /// Sensor replay file: one JSON sensor event per line
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Cockpit line period in milliseconds
    #[arg(long, default_value_t = 500)]
    log_period: u64,
}

/// Synthetic pilot used by `-c auto`: settle, hold the yaw stick to arm,
/// then raise SWA to start the mission script.
fn auto_pilot(feed: RcFeed, run: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("auto-pilot".into())
        .spawn(move || {
            let start = std::time::Instant::now();
            while run.load(Ordering::Relaxed) {
                let elapsed = start.elapsed();
                let mut frame = RcFrame::all_low();
                frame.channels[CH_ROLL] = 1500;
                frame.channels[CH_PITCH] = 1500;
                frame.channels[CH_YAW] = 1500;
                if elapsed > Duration::from_secs(1) && elapsed < Duration::from_millis(4_600) {
                    frame.channels[CH_YAW] = 2000; // arm gesture
                }
                if elapsed >= Duration::from_secs(5) {
                    frame.channels[CH_SWA] = 2000; // start scenario
                }
                feed.push(frame);
                thread::sleep(Duration::from_millis(14));
            }
        })
        .expect("spawning auto-pilot thread")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("quadpilot starting, {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

    // configuration errors fail startup before anything can arm
    let vehicle = config::load_vehicle_config(&args.config)
        .with_context(|| format!("loading vehicle config {}", args.config.display()))?;
    let mission = config::load_mission(&args.mission)
        .with_context(|| format!("loading mission script {}", args.mission.display()))?;
    info!("mission: {} steps", mission.len());

    // shutdown: the signal handler asks the supervisor for a controlled
    // disarm; clearing `run` alone stops the loops without touching motors
    let run = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(AtomicBool::new(false));
    let calib_gate = Arc::new(AtomicBool::new(true));
    {
        let shutdown = shutdown.clone();
        let calib_gate = calib_gate.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
            calib_gate.store(false, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let mut sensor_client: Box<dyn SensorClient> = match &args.replay {
        Some(path) => Box::new(
            ReplaySensors::open(path)
                .with_context(|| format!("opening replay file {}", path.display()))?,
        ),
        None => bail!("no sensor backend available; supply --replay <file>"),
    };

    // startup calibration blocks until the vehicle has averaged enough
    // stationary samples and seen a good GPS fix
    info!("calibrating (vehicle must be stationary)");
    let calib = Arc::new(
        meas::acquire(sensor_client.as_mut(), CalibrationConfig::default(), &calib_gate)
            .context("sensor calibration")?,
    );

    // filter thread
    let ekf_handle = ekf::spawn(sensor_client, calib.clone(), EkfTuning::default(), run.clone());

    // RC input: a real bus in rc mode, the synthetic pilot in auto mode
    let (rc_handle, pilot) = match args.control {
        ControlMode::Auto => {
            info!("control AUTO mode");
            let (feed, bus) = ChannelRc::pair(64);
            let pilot = auto_pilot(feed, run.clone());
            (rc::spawn(Box::new(bus), run.clone()), Some(pilot))
        }
        ControlMode::Rc => {
            info!("control RC mode");
            bail!("no RC bus backend available on this platform; use -c auto");
        }
    };

    // motor outputs: dry-run controller, duty writes are logged only
    let motors = MockMotors::new();
    let mma = Mma::new(vehicle.atten, [MotorLin::default(); 4], Box::new(motors));

    let mut supervisor = Supervisor::new(
        ControlConfig {
            pids: vehicle.pids,
            throttle: vehicle.throttle,
            log_period_ms: args.log_period,
        },
        mission,
        mma,
        rc_handle.shared.clone(),
        ekf_handle.estimate.clone(),
        calib,
    );
    supervisor.set_shutdown_flag(shutdown);

    let control_handle = control::spawn(supervisor, run.clone());

    // the control thread clears `run` when the mission ends or aborts
    control_handle.join();
    run.store(false, Ordering::Relaxed);
    ekf_handle.join();
    rc_handle.join();
    if let Some(p) = pilot {
        let _ = p.join();
    }

    info!("clean shutdown");
    Ok(())
}
