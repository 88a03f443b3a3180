// config — vehicle configuration and mission script parsing.
//
// Both files share one small text format: a section starts with an
// `@HEADER` line and carries `key=value` fields until the next header.
// Unknown headers may be skipped in lenient mode (the vehicle config lives
// in a file shared with other tools); unknown fields inside a known section
// are always an error. Every numeric constraint is checked here, before
// anything can arm.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::warn;
use nalgebra::Vector3;
use thiserror::Error;

use crate::control::mma::{AttenCurve, MmaConfigError};
use crate::control::pid::{PidCoef, PidCtx};
use crate::control::{MissionStep, QuadPids, ThrottleRange};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected `key=value`, got \"{text}\"")]
    Syntax { line: usize, text: String },
    #[error("line {line}: unknown header @{name}")]
    UnknownHeader { line: usize, name: String },
    #[error("section @{section}: unknown field \"{field}\"")]
    UnknownField { section: String, field: String },
    #[error("section @{section}: missing field \"{field}\"")]
    MissingField { section: String, field: &'static str },
    #[error("section @{section}: field \"{field}\" has invalid value \"{value}\"")]
    BadValue { section: String, field: &'static str, value: String },
    #[error("unknown flight mode type \"{0}\"")]
    UnknownFlightType(String),
    #[error("expected {expected} @{section} sections, found {found}")]
    SectionCount { section: &'static str, expected: usize, found: usize },
    #[error("throttle range [{min}, {max}] is invalid")]
    BadThrottle { min: f64, max: f64 },
    #[error(transparent)]
    Attenuation(#[from] MmaConfigError),
}

// ─── Section scanner ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Section {
    name: String,
    line: usize,
    fields: HashMap<String, String>,
}

/// Split a file into sections. `known` lists the headers the caller will
/// consume; in lenient mode anything else is skipped with a warning,
/// otherwise it is an error.
fn scan_sections(text: &str, known: &[&str], lenient: bool) -> Result<Vec<Section>, ConfigError> {
    let mut sections: Vec<Section> = Vec::new();
    let mut skipping = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(name) = trimmed.strip_prefix('@') {
            let name = name.trim();
            if known.contains(&name) {
                skipping = false;
                sections.push(Section { name: name.to_string(), line, fields: HashMap::new() });
            } else if lenient {
                warn!("config: ignoring unknown header @{} (line {})", name, line);
                skipping = true;
            } else {
                return Err(ConfigError::UnknownHeader { line, name: name.to_string() });
            }
            continue;
        }

        if skipping {
            continue;
        }

        let (key, value) = trimmed.split_once('=').ok_or_else(|| ConfigError::Syntax {
            line,
            text: trimmed.to_string(),
        })?;
        match sections.last_mut() {
            Some(section) => {
                section.fields.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                return Err(ConfigError::Syntax { line, text: trimmed.to_string() });
            }
        }
    }

    Ok(sections)
}

impl Section {
    /// Reject any field outside the allowed set.
    fn check_fields(&self, allowed: &[&str]) -> Result<(), ConfigError> {
        for field in self.fields.keys() {
            if !allowed.contains(&field.as_str()) {
                return Err(ConfigError::UnknownField {
                    section: self.name.clone(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    fn int(&self, field: &'static str) -> Result<i64, ConfigError> {
        let value = self.fields.get(field).ok_or(ConfigError::MissingField {
            section: self.name.clone(),
            field,
        })?;
        value.parse().map_err(|_| ConfigError::BadValue {
            section: self.name.clone(),
            field,
            value: value.clone(),
        })
    }

    fn uint(&self, field: &'static str) -> Result<u64, ConfigError> {
        let v = self.int(field)?;
        if v < 0 {
            return Err(ConfigError::BadValue {
                section: self.name.clone(),
                field,
                value: v.to_string(),
            });
        }
        Ok(v as u64)
    }

    fn uint_or(&self, field: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.fields.get(field) {
            None => Ok(default),
            Some(_) => self.uint(field),
        }
    }

    fn float(&self, field: &'static str) -> Result<f64, ConfigError> {
        let value = self.fields.get(field).ok_or(ConfigError::MissingField {
            section: self.name.clone(),
            field,
        })?;
        let parsed: f64 = value.parse().map_err(|_| ConfigError::BadValue {
            section: self.name.clone(),
            field,
            value: value.clone(),
        })?;
        if !parsed.is_finite() {
            return Err(ConfigError::BadValue {
                section: self.name.clone(),
                field,
                value: value.clone(),
            });
        }
        Ok(parsed)
    }
}

// ─── Mission script ──────────────────────────────────────────────────────────

const TAKEOFF_IDLE_DEFAULT_MS: u64 = 3000;
const TAKEOFF_SPOOL_DEFAULT_MS: u64 = 3000;
const TAKEOFF_LIFT_DEFAULT_MS: u64 = 2000;

pub fn parse_mission(text: &str) -> Result<Vec<MissionStep>, ConfigError> {
    let sections = scan_sections(text, &["flight_mode"], false)?;
    let mut mission = Vec::with_capacity(sections.len());

    for section in &sections {
        let kind = section.fields.get("type").ok_or(ConfigError::MissingField {
            section: section.name.clone(),
            field: "type",
        })?;

        let step = match kind.as_str() {
            "flight_takeoff" => {
                section.check_fields(&["type", "alt", "idleT", "spoolT", "liftT"])?;
                MissionStep::Takeoff {
                    alt_mm: section.int("alt")?,
                    idle_ms: section.uint_or("idleT", TAKEOFF_IDLE_DEFAULT_MS)?,
                    spool_ms: section.uint_or("spoolT", TAKEOFF_SPOOL_DEFAULT_MS)?,
                    lift_ms: section.uint_or("liftT", TAKEOFF_LIFT_DEFAULT_MS)?,
                }
            }
            "flight_position" => {
                section.check_fields(&["type", "alt", "lat", "lon"])?;
                MissionStep::Position {
                    alt_mm: section.int("alt")?,
                    lat_e7: section.int("lat")?,
                    lon_e7: section.int("lon")?,
                }
            }
            "flight_hover" => {
                section.check_fields(&["type", "alt", "time"])?;
                let alt_mm = section.int("alt")?;
                if alt_mm < 0 {
                    return Err(ConfigError::BadValue {
                        section: section.name.clone(),
                        field: "alt",
                        value: alt_mm.to_string(),
                    });
                }
                MissionStep::Hover { alt_mm, time_ms: section.uint("time")? }
            }
            "flight_landing" => {
                section.check_fields(&["type", "descent", "diff", "timeout"])?;
                MissionStep::Landing {
                    descent_mms: section.int("descent")?,
                    diff_mm: section.int("diff")?,
                    timeout_ms: section.uint("timeout")?,
                }
            }
            "flight_manual" => {
                section.check_fields(&["type"])?;
                MissionStep::Manual
            }
            "flight_manualAbort" => {
                section.check_fields(&["type"])?;
                MissionStep::ManualAbort
            }
            "flight_end" => {
                section.check_fields(&["type"])?;
                MissionStep::End
            }
            other => return Err(ConfigError::UnknownFlightType(other.to_string())),
        };
        mission.push(step);
    }

    Ok(mission)
}

pub fn load_mission(path: &Path) -> Result<Vec<MissionStep>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_mission(&text)
}

// ─── Vehicle configuration ───────────────────────────────────────────────────

/// One parsed @PID section. The runtime clips every block symmetrically; MIN
/// and IMIN are accepted and sanity-checked against their positive
/// counterparts.
#[derive(Clone, Copy, Debug)]
struct PidGains {
    p: f64,
    i: f64,
    d: f64,
    max: f64,
    imax: f64,
}

fn parse_pid_section(section: &Section) -> Result<PidGains, ConfigError> {
    section.check_fields(&["P", "I", "D", "MAX", "MIN", "IMAX", "IMIN"])?;
    let p = section.float("P")?;
    let i = section.float("I")?;
    let d = section.float("D")?;
    let max = section.float("MAX")?;
    let min = section.float("MIN")?;
    let imax = section.float("IMAX")?;
    let imin = section.float("IMIN")?;

    if min > max {
        return Err(ConfigError::BadValue {
            section: section.name.clone(),
            field: "MIN",
            value: min.to_string(),
        });
    }
    if imin > imax {
        return Err(ConfigError::BadValue {
            section: section.name.clone(),
            field: "IMIN",
            value: imin.to_string(),
        });
    }

    Ok(PidGains { p, i, d, max, imax })
}

fn scalar_pid(g: &PidGains) -> PidCtx<f64> {
    PidCtx::new(
        // the R stage passes the position error through unscaled; axis
        // shaping happens in the PID blocks
        PidCoef::new(1.0, g.max.abs(), 0.0),
        PidCoef::new(g.p, g.max.abs(), 0.0),
        PidCoef::new(g.i, g.imax.abs(), 0.0),
        PidCoef::new(g.d, g.max.abs(), 0.0),
    )
}

fn vector_pid(g: &PidGains) -> PidCtx<Vector3<f64>> {
    PidCtx::new(
        PidCoef::new(1.0, g.max.abs(), 0.0),
        PidCoef::new(g.p, g.max.abs(), 0.0),
        PidCoef::new(g.i, g.imax.abs(), 0.0),
        PidCoef::new(g.d, g.max.abs(), 0.0),
    )
}

pub struct VehicleConfig {
    pub pids: QuadPids,
    pub throttle: ThrottleRange,
    pub atten: AttenCurve,
}

/// Parse the vehicle configuration: five @PID sections in the order roll,
/// pitch, yaw, altitude, position, one @THROTTLE and one @ATTENUATION.
/// Headers other than these are ignored (the file is shared with tools
/// that keep their own sections there).
pub fn parse_vehicle_config(text: &str) -> Result<VehicleConfig, ConfigError> {
    let sections = scan_sections(text, &["PID", "THROTTLE", "ATTENUATION"], true)?;

    let pid_sections: Vec<&Section> = sections.iter().filter(|s| s.name == "PID").collect();
    if pid_sections.len() != 5 {
        return Err(ConfigError::SectionCount {
            section: "PID",
            expected: 5,
            found: pid_sections.len(),
        });
    }
    let mut gains = Vec::with_capacity(5);
    for section in &pid_sections {
        gains.push(parse_pid_section(section)?);
    }

    let mut yaw = scalar_pid(&gains[2]);
    yaw.err_bound = Some(std::f64::consts::PI);
    let pids = QuadPids {
        roll: scalar_pid(&gains[0]),
        pitch: scalar_pid(&gains[1]),
        yaw,
        alt: scalar_pid(&gains[3]),
        pos: vector_pid(&gains[4]),
    };

    let throttle_sections: Vec<&Section> =
        sections.iter().filter(|s| s.name == "THROTTLE").collect();
    if throttle_sections.len() != 1 {
        return Err(ConfigError::SectionCount {
            section: "THROTTLE",
            expected: 1,
            found: throttle_sections.len(),
        });
    }
    let ts = throttle_sections[0];
    ts.check_fields(&["MAX", "MIN"])?;
    let throttle = ThrottleRange { min: ts.float("MIN")?, max: ts.float("MAX")? };
    if !(0.0..=1.0).contains(&throttle.min)
        || !(0.0..=1.0).contains(&throttle.max)
        || throttle.min >= throttle.max
    {
        return Err(ConfigError::BadThrottle { min: throttle.min, max: throttle.max });
    }

    let atten_sections: Vec<&Section> =
        sections.iter().filter(|s| s.name == "ATTENUATION").collect();
    if atten_sections.len() != 1 {
        return Err(ConfigError::SectionCount {
            section: "ATTENUATION",
            expected: 1,
            found: atten_sections.len(),
        });
    }
    let at = atten_sections[0];
    at.check_fields(&["START", "MIDARG", "MIDVAL", "END", "SLOPE"])?;
    let atten = AttenCurve::new(
        at.float("START")?,
        at.float("MIDARG")?,
        at.float("MIDVAL")?,
        at.float("END")?,
    )?;

    Ok(VehicleConfig { pids, throttle, atten })
}

pub fn load_vehicle_config(path: &Path) -> Result<VehicleConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_vehicle_config(&text)
}
