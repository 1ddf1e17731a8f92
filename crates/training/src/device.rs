use std::{fmt, str::FromStr};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};

use crate::TrainingError;

/// Device selection as written in configuration or on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    /// First available accelerator, falling back to the CPU.
    Auto,
    Cpu,
    /// CUDA ordinal; `None` selects the ordinal matching the local rank.
    Cuda(Option<usize>),
    Metal(Option<usize>),
}

impl FromStr for DeviceRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match value.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|err| format!("invalid device ordinal in '{s}': {err}"))?;
                (kind.to_string(), Some(ordinal))
            }
            None => (value, None),
        };
        match (kind.as_str(), ordinal) {
            ("auto", None) => Ok(DeviceRequest::Auto),
            ("cpu", None) => Ok(DeviceRequest::Cpu),
            ("cuda" | "gpu", ordinal) => Ok(DeviceRequest::Cuda(ordinal)),
            ("metal" | "mps", ordinal) => Ok(DeviceRequest::Metal(ordinal)),
            _ => Err(format!(
                "unknown device '{s}' (expected auto, cpu, cuda[:N] or metal[:N])"
            )),
        }
    }
}

/// The device every tensor of one worker lives on, decided once at startup.
#[derive(Debug, Clone)]
pub struct ExecutionTarget {
    device: Device,
    label: String,
}

impl ExecutionTarget {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            label: "cpu".to_string(),
        }
    }

    /// Explicit accelerator requests fail loudly; `Auto` degrades to the CPU with a warning.
    pub fn resolve(request: DeviceRequest, local_rank: usize) -> Result<Self, TrainingError> {
        match request {
            DeviceRequest::Cpu => Ok(Self::cpu()),
            DeviceRequest::Cuda(ordinal) => {
                let ordinal = ordinal.unwrap_or(local_rank);
                let device = Device::new_cuda(ordinal).map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to initialize cuda:{ordinal}: {err}"
                    ))
                })?;
                Ok(Self {
                    device,
                    label: format!("cuda:{ordinal}"),
                })
            }
            DeviceRequest::Metal(ordinal) => {
                let ordinal = ordinal.unwrap_or(0);
                let device = Device::new_metal(ordinal).map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to initialize metal:{ordinal}: {err}"
                    ))
                })?;
                Ok(Self {
                    device,
                    label: format!("metal:{ordinal}"),
                })
            }
            DeviceRequest::Auto => {
                if cuda_is_available() {
                    match Device::new_cuda(local_rank) {
                        Ok(device) => {
                            return Ok(Self {
                                device,
                                label: format!("cuda:{local_rank}"),
                            })
                        }
                        Err(err) => {
                            log::warn!("cuda reported available but cuda:{local_rank} failed: {err}")
                        }
                    }
                }
                if metal_is_available() {
                    match Device::new_metal(0) {
                        Ok(device) => {
                            return Ok(Self {
                                device,
                                label: "metal:0".to_string(),
                            })
                        }
                        Err(err) => log::warn!("failed to initialize metal device: {err}"),
                    }
                }
                log::warn!("no accelerator available; using CPU, this will be slow");
                Ok(Self::cpu())
            }
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Seeds the accelerator RNG; the CPU backend has none to seed.
    pub fn seed(&self, seed: u64) {
        if self.device.is_cpu() {
            return;
        }
        if let Err(err) = self.device.set_seed(seed) {
            log::warn!("failed to seed {} RNG: {err}", self.label);
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
