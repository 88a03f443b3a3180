// ekf — 17-state error-state filter: quaternion attitude, gyro and
// accelerometer biases, NED velocity and position.
//
// The filter owns all of its matrix workspaces and runs on its own thread:
// it drains the sensor-event channel, predicts over the wall-clock timestep
// on every event, applies the matching measurement update, and publishes a
// read-only snapshot for the control side. Predict and update are strictly
// serialised here; only snapshot readers run concurrently.

pub mod baro;
pub mod core;
pub mod gps;
pub mod imu;
pub mod model;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};
use nalgebra::Vector3;

use crate::meas::{Calibration, MeasAdapter, Measurement};
use crate::sensors::SensorClient;
use crate::types::{SensorEvent, StateEstimate};

use baro::BaroEngine;
use core::StateEngine;
use gps::GpsEngine;
use imu::ImuEngine;
use model::{
    state_quat, state_vec3, QuadModel, BAX, BWX, CTRL_LEN, RX, RY, STATE_LEN, UAX, UAY, UAZ, UWX,
    UWY, UWZ, VX, VY, VZ,
};

pub use model::EkfTuning;

/// Timestep used when event timestamps cannot provide one.
const DEFAULT_DT: f64 = 0.001;
/// Sanity ceiling on the prediction timestep; longer gaps are truncated so
/// one stalled stream cannot catapult the covariance.
const MAX_DT: f64 = 0.5;

/// Shared, never-torn snapshot of the filter output.
#[derive(Clone, Default)]
pub struct EstimateBus {
    inner: Arc<Mutex<StateEstimate>>,
}

impl EstimateBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> StateEstimate {
        *self.inner.lock().unwrap()
    }

    pub(crate) fn publish(&self, est: StateEstimate) {
        *self.inner.lock().unwrap() = est;
    }
}

pub struct Ekf {
    engine: StateEngine,
    model: QuadModel,
    imu: ImuEngine,
    baro: BaroEngine,
    gps: GpsEngine,
    adapter: MeasAdapter,

    estimate: EstimateBus,

    /// Vertical channel published to the control layer. Driven directly by
    /// the barometric Δh stream while inertial position reckoning is not
    /// trusted for altitude.
    baro_ned_z: f64,

    last_step_us: Option<u64>,
    steps: u64,
}

impl Ekf {
    pub fn new(calib: Arc<Calibration>, tuning: EkfTuning) -> Self {
        let model = QuadModel::new(&calib, tuning.clone());
        let mut engine = StateEngine::new(STATE_LEN, CTRL_LEN);
        model.init_state(&mut engine.state, &calib);
        model.init_cov(&mut engine.cov);
        // the control vector starts at the stationary fixpoint
        engine.u.vec_set(UAZ, -calib.gravity);

        let imu = ImuEngine::new(&calib, &tuning);
        let baro = BaroEngine::new(&tuning);
        let gps = GpsEngine::new(&tuning);

        let mut ekf = Self {
            engine,
            model,
            imu,
            baro,
            gps,
            adapter: MeasAdapter::new(calib),
            estimate: EstimateBus::new(),
            baro_ned_z: 0.0,
            last_step_us: None,
            steps: 0,
        };
        ekf.publish();
        ekf
    }

    pub fn estimate_bus(&self) -> EstimateBus {
        self.estimate.clone()
    }

    /// Updates skipped over numerical trouble, across all three models.
    pub fn skipped_updates(&self) -> u64 {
        self.imu.update.skipped + self.baro.update.skipped + self.gps.update.skipped
    }

    fn step_dt(&mut self, timestamp: u64) -> f64 {
        let dt = match self.last_step_us {
            Some(last) if timestamp > last => ((timestamp - last) as f64 / 1e6).min(MAX_DT),
            Some(_) => return 0.0, // out-of-order event, no time advance
            None => DEFAULT_DT,
        };
        self.last_step_us = Some(timestamp);
        dt.max(1e-6)
    }

    /// Serialised predict + update for one sensor event.
    pub fn handle_event(&mut self, evt: &SensorEvent) {
        let meas = match self.adapter.feed(evt) {
            Some(m) => m,
            None => return,
        };

        match meas {
            Measurement::Imu(sample) => {
                let dt = self.step_dt(sample.timestamp);
                let u = &mut self.engine.u;
                u.vec_set(UWX, sample.gyro.x);
                u.vec_set(UWY, sample.gyro.y);
                u.vec_set(UWZ, sample.gyro.z);
                u.vec_set(UAX, sample.accel.x);
                u.vec_set(UAY, sample.accel.y);
                u.vec_set(UAZ, sample.accel.z);

                self.engine.predict(&self.model, dt);
                self.imu.fill(&sample, &self.engine.state);
                self.imu.update.apply(&mut self.engine, &self.model, &self.imu.model, dt);
            }

            Measurement::Baro(delta) => {
                let dt = self.step_dt(delta.timestamp);
                self.engine.predict(&self.model, dt);
                match self.baro.fill(&delta) {
                    Some(sample_dt) => {
                        self.baro.update.apply(
                            &mut self.engine,
                            &self.model,
                            &self.baro.model,
                            sample_dt,
                        );
                        self.baro_ned_z += delta.dz;
                    }
                    None => self.engine.commit_prediction(&self.model),
                }
            }

            Measurement::Gps(fix) => {
                let dt = self.step_dt(fix.timestamp);
                self.engine.predict(&self.model, dt);
                if self.gps.fill(&fix) {
                    self.gps.update.apply(&mut self.engine, &self.model, &self.gps.model, dt);
                } else {
                    self.engine.commit_prediction(&self.model);
                    debug!("ekf: gps event without a position fix, skipped");
                }
            }
        }

        self.steps += 1;
        self.publish();
    }

    fn publish(&mut self) {
        let state = &self.engine.state;
        let q = state_quat(state);
        let (roll, pitch, yaw) = q.to_euler();

        let bw = state_vec3(state, BWX);
        let ba = state_vec3(state, BAX);
        let w_meas = state_vec3(&self.engine.u, UWX);
        let a_meas = state_vec3(&self.engine.u, UAX);

        // body rates with the residual bias removed
        let rates = w_meas - bw;

        // earth-frame kinematic acceleration
        let mut a_ned = q.rotate(&(a_meas - ba));
        a_ned += Vector3::new(0.0, 0.0, self.model.gravity());

        self.estimate.publish(StateEstimate {
            q,
            roll,
            pitch,
            yaw,
            ned_x: state.vec_at(RX),
            ned_y: state.vec_at(RY),
            ned_z: self.baro_ned_z,
            vel_x: state.vec_at(VX),
            vel_y: state.vec_at(VY),
            vel_z: state.vec_at(VZ),
            roll_rate: rates.x,
            pitch_rate: rates.y,
            yaw_rate: rates.z,
            accel_x: a_ned.x,
            accel_y: a_ned.y,
            accel_z: a_ned.z,
            accel_bias_z: ba.z,
        });
    }
}

// ─── Filter thread ───────────────────────────────────────────────────────────

pub struct EkfHandle {
    pub estimate: EstimateBus,
    join: JoinHandle<()>,
}

impl EkfHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

/// Spawn the filter thread. It drains the sensor client until the run flag
/// clears; the read timeout keeps the final join bounded.
pub fn spawn(
    mut client: Box<dyn SensorClient>,
    calib: Arc<Calibration>,
    tuning: EkfTuning,
    run: Arc<AtomicBool>,
) -> EkfHandle {
    let mut ekf = Ekf::new(calib, tuning);
    let estimate = ekf.estimate_bus();

    let join = thread::Builder::new()
        .name("ekf".into())
        .spawn(move || {
            info!("ekf: filter thread up");
            while run.load(Ordering::Relaxed) {
                if let Some(evt) = client.recv(Duration::from_millis(100)) {
                    ekf.handle_event(&evt);
                }
            }
            info!(
                "ekf: filter thread down after {} steps ({} updates skipped)",
                ekf.steps,
                ekf.skipped_updates()
            );
        })
        .expect("spawning ekf thread");

    EkfHandle { estimate, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meas::{CalibrationConfig, Calibrator};
    use crate::types::{AccelRaw, BaroRaw, GpsRaw, GyroRaw, MagRaw, SensorPayload};
    use approx::assert_abs_diff_eq;

    const REF_LAT_E9: i64 = 52_000_000_000;
    const REF_LON_E9: i64 = 21_000_000_000;

    fn imu_events(ts: u64) -> [SensorEvent; 3] {
        [
            SensorEvent {
                timestamp: ts,
                device_id: 0,
                payload: SensorPayload::Gyro(GyroRaw::default()),
            },
            SensorEvent {
                timestamp: ts,
                device_id: 0,
                payload: SensorPayload::Mag(MagRaw { mag_x: 220, mag_y: 0, mag_z: -410 }),
            },
            SensorEvent {
                timestamp: ts + 10,
                device_id: 0,
                payload: SensorPayload::Accel(AccelRaw {
                    accel_x: 0,
                    accel_y: 0,
                    accel_z: -9807,
                }),
            },
        ]
    }

    fn baro_event(ts: u64, pressure: u32) -> SensorEvent {
        SensorEvent {
            timestamp: ts,
            device_id: 0,
            payload: SensorPayload::Baro(BaroRaw { pressure, temp: 293_150 }),
        }
    }

    fn gps_event(ts: u64) -> SensorEvent {
        SensorEvent {
            timestamp: ts,
            device_id: 0,
            payload: SensorPayload::Gps(GpsRaw {
                lat: REF_LAT_E9,
                lon: REF_LON_E9,
                alt: 100_000,
                hdop: 110,
                fix: 3,
                sats_nb: 10,
                ..Default::default()
            }),
        }
    }

    /// Run the full calibration pipeline on synthetic stationary data.
    fn calibrate() -> Arc<Calibration> {
        let mut cfg = CalibrationConfig::default();
        cfg.imu_samples = 50;
        cfg.baro_samples = 10;
        cfg.gps_samples = 3;
        let mut cal = Calibrator::new(cfg).unwrap();

        let mut ts = 1_000u64;
        while !cal.is_complete() {
            ts += 1_000;
            for evt in imu_events(ts) {
                cal.feed(&evt);
            }
            cal.feed(&baro_event(ts, 101_325));
            cal.feed(&gps_event(ts));
        }
        Arc::new(cal.finish().unwrap())
    }

    #[test]
    fn quaternion_stays_normalised_through_mixed_updates() {
        let calib = calibrate();
        let mut ekf = Ekf::new(calib, EkfTuning::default());

        let mut ts = 10_000_000u64;
        for i in 0..500 {
            ts += 1_000;
            for evt in imu_events(ts) {
                ekf.handle_event(&evt);
            }
            if i % 50 == 0 {
                ekf.handle_event(&baro_event(ts + 100, 101_325));
            }
            if i % 100 == 0 {
                ekf.handle_event(&gps_event(ts + 200));
            }

            let q = ekf.estimate.get().q;
            assert!((q.norm() - 1.0).abs() < 1e-4, "|q| = {}", q.norm());
        }
        assert_eq!(ekf.skipped_updates(), 0);
    }

    #[test]
    fn covariance_symmetric_after_mixed_updates() {
        let calib = calibrate();
        let mut ekf = Ekf::new(calib, EkfTuning::default());

        let mut ts = 10_000_000u64;
        for _ in 0..100 {
            ts += 1_000;
            for evt in imu_events(ts) {
                ekf.handle_event(&evt);
            }
        }
        ekf.handle_event(&baro_event(ts + 500, 101_320));
        ekf.handle_event(&gps_event(ts + 900));

        let cov = &ekf.engine.cov;
        for r in 0..STATE_LEN {
            for c in 0..STATE_LEN {
                let bound = 1e-5 * cov.at(r, r).abs().max(cov.at(c, c).abs());
                assert!((cov.at(r, c) - cov.at(c, r)).abs() <= bound.max(1e-12));
            }
        }
    }

    #[test]
    fn baro_stream_drives_published_altitude() {
        let calib = calibrate();
        let mut ekf = Ekf::new(calib, EkfTuning::default());

        // pressure falls ~118 Pa over the run: roughly +10 m altitude
        let mut ts = 10_000_000u64;
        let mut pressure = 101_325f64;
        for _ in 0..200 {
            ts += 50_000;
            for evt in imu_events(ts) {
                ekf.handle_event(&evt);
            }
            pressure -= 0.59;
            ekf.handle_event(&baro_event(ts + 1000, pressure as u32));
        }

        let alt = ekf.estimate.get().altitude();
        assert!(alt > 5.0 && alt < 15.0, "altitude = {}", alt);
    }

    #[test]
    fn gps_fix_away_from_origin_moves_position() {
        let calib = calibrate();
        let mut ekf = Ekf::new(calib, EkfTuning::default());

        // roughly 11 m north of the reference
        let mut ts = 10_000_000u64;
        for _ in 0..100 {
            ts += 1_000;
            for evt in imu_events(ts) {
                ekf.handle_event(&evt);
            }
            ekf.handle_event(&SensorEvent {
                timestamp: ts + 500,
                device_id: 0,
                payload: SensorPayload::Gps(GpsRaw {
                    lat: REF_LAT_E9 + 100_000,
                    lon: REF_LON_E9,
                    alt: 100_000,
                    hdop: 110,
                    fix: 3,
                    sats_nb: 10,
                    ..Default::default()
                }),
            });
        }

        let est = ekf.estimate.get();
        assert!(est.ned_x > 8.0 && est.ned_x < 13.0, "ned_x = {}", est.ned_x);
        assert_abs_diff_eq!(est.ned_y, 0.0, epsilon = 0.5);
    }

    #[test]
    fn gps_loss_keeps_estimates_finite_and_bounded() {
        let calib = calibrate();
        let mut ekf = Ekf::new(calib, EkfTuning::default());

        let mut ts = 10_000_000u64;
        for _ in 0..50 {
            ts += 1_000;
            for evt in imu_events(ts) {
                ekf.handle_event(&evt);
            }
            ekf.handle_event(&gps_event(ts + 500));
        }

        // GPS stops; IMU and baro continue for five simulated seconds
        for i in 0..5000u64 {
            ts += 1_000;
            for evt in imu_events(ts) {
                ekf.handle_event(&evt);
            }
            if i % 50 == 0 {
                ekf.handle_event(&baro_event(ts + 100, 101_325));
            }
        }

        let est = ekf.estimate.get();
        for v in [est.ned_x, est.ned_y, est.vel_x, est.vel_y, est.vel_z, est.roll, est.pitch] {
            assert!(v.is_finite());
        }
        assert!(est.horizontal_speed() < 2.0);
        assert_eq!(ekf.skipped_updates(), 0);
    }

    #[test]
    fn thread_spawn_and_bounded_shutdown() {
        use crate::sensors::ChannelSensors;

        let calib = calibrate();
        let (feed, client) = ChannelSensors::pair(64);
        let run = Arc::new(AtomicBool::new(true));
        let handle = spawn(Box::new(client), calib, EkfTuning::default(), run.clone());

        let mut ts = 10_000_000u64;
        for _ in 0..20 {
            ts += 1_000;
            for evt in imu_events(ts) {
                feed.push(evt);
            }
        }
        std::thread::sleep(Duration::from_millis(50));

        let q = handle.estimate.get().q;
        assert!((q.norm() - 1.0).abs() < 1e-4);

        run.store(false, Ordering::Relaxed);
        handle.join();
    }

    #[test]
    fn initial_estimate_matches_calibration_attitude() {
        let calib = calibrate();
        let init_q = calib.init_quat;
        let ekf = Ekf::new(calib, EkfTuning::default());
        let est = ekf.estimate.get();
        assert_abs_diff_eq!(est.q.dot(&init_q).abs(), 1.0, epsilon = 1e-9);
        assert_eq!(est.ned_z, 0.0);
    }
}
