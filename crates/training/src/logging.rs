use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{config::LoggingConfig, distributed::DistributedContext, TrainingError};

/// Destination for scalar time series such as losses and accuracies.
pub trait TelemetrySink: Send {
    fn emit_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), TrainingError>;

    fn flush(&mut self) -> Result<(), TrainingError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit_scalar(&mut self, _name: &str, _value: f64, _step: u64) -> Result<(), TrainingError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Telemetry for this rank: TensorBoard on the coordinator when configured,
/// [`NullSink`] everywhere else.
pub fn build_sink(
    config: &LoggingConfig,
    context: &DistributedContext,
) -> Result<Box<dyn TelemetrySink>, TrainingError> {
    match (&config.tensorboard, context.is_coordinator()) {
        (Some(dir), true) => {
            let writer = TensorBoardWriter::create(dir, config.tensorboard_flush_every_n)?;
            log::info!("writing tensorboard events to {}", writer.path().display());
            Ok(Box::new(writer))
        }
        _ => Ok(Box::new(NullSink)),
    }
}

/// Appends `Event` records to a TensorBoard event file.
///
/// Each record is framed as `len:u64le, masked_crc(len):u32le, data,
/// masked_crc(data):u32le`.
pub struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        writer.flush()?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(&data).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }
}

impl TelemetrySink for TensorBoardWriter {
    fn emit_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step: step as i64,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: name.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = TelemetrySink::flush(self);
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::Backend;

    fn read_events(path: &Path) -> Vec<Event> {
        let bytes = fs::read(path).unwrap();
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len_bytes: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len_bytes));
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(data));
            events.push(Event::decode(data).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn scalars_are_framed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut writer = TensorBoardWriter::create(dir.path(), 10).unwrap();
            writer.emit_scalar("val/acc1", 55.25, 3).unwrap();
            writer.emit_scalar("val/loss", 1.5, 3).unwrap();
            writer.path().to_path_buf()
        };

        let events = read_events(&path);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].file_version.as_deref(), Some("brain.Event:2"));
        let value = &events[1].summary.as_ref().unwrap().value[0];
        assert_eq!(value.tag, "val/acc1");
        assert_eq!(value.simple_value, Some(55.25));
        assert_eq!(events[2].step, 3);
    }

    #[test]
    fn only_the_coordinator_writes_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            tensorboard: Some(dir.path().join("tb")),
            ..LoggingConfig::default()
        };
        let worker = DistributedContext::new(1, 2, Backend::InProcess).unwrap();
        build_sink(&config, &worker).unwrap();
        assert!(!dir.path().join("tb").exists());

        build_sink(&config, &DistributedContext::single()).unwrap();
        assert!(dir.path().join("tb").is_dir());
    }
}
