//! DS18B20 thermometers over the kernel w1 sysfs interface.

use crate::error::HardwareError;
use crate::runtime::scheduler::PeriodicUpdate;
use crate::sensor::SensorReporter;
use async_trait::async_trait;
use log::error;
use std::path::PathBuf;
use std::time::Duration;

pub struct DallasSensor {
    reporter: SensorReporter,
    device_path: PathBuf,
}

impl DallasSensor {
    pub fn new(reporter: SensorReporter, address: &str) -> Self {
        DallasSensor {
            reporter,
            device_path: PathBuf::from(format!("/sys/bus/w1/devices/{address}/w1_slave")),
        }
    }

    #[cfg(test)]
    fn with_path(reporter: SensorReporter, device_path: PathBuf) -> Self {
        DallasSensor {
            reporter,
            device_path,
        }
    }

    fn read(&self) -> Result<f64, HardwareError> {
        let text = std::fs::read_to_string(&self.device_path).map_err(|e| {
            HardwareError::OneWire(format!("{}: {e}", self.device_path.display()))
        })?;
        parse_w1_slave(&text)
            .ok_or_else(|| HardwareError::OneWire(format!("bad reading from {:?}", self.device_path)))
    }
}

/// The kernel reports two lines; the first ends in `YES` when the CRC
/// matched, the second carries `t=` in milli-degrees.
fn parse_w1_slave(text: &str) -> Option<f64> {
    let mut lines = text.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }
    let temp_line = lines.next()?;
    let milli: f64 = temp_line.rsplit("t=").next()?.trim().parse().ok()?;
    Some(milli / 1000.0)
}

#[async_trait]
impl PeriodicUpdate for DallasSensor {
    fn update_id(&self) -> String {
        self.reporter.id.clone()
    }

    async fn refresh(&self, timestamp: f64) -> Option<Duration> {
        match self.read() {
            Ok(temperature) => self.reporter.report(temperature, timestamp),
            Err(err) => error!("Dallas sensor {} read failed: {err}", self.reporter.id),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::local::LocalMessageBus;
    use crate::runtime::EventBus;
    use std::sync::Arc;

    #[test]
    fn parses_w1_slave_output() {
        let text = "5b 01 4b 46 7f ff 0c 10 a1 : crc=a1 YES\n5b 01 4b 46 7f ff 0c 10 a1 t=21687\n";
        assert_eq!(parse_w1_slave(text), Some(21.687));
        let bad_crc = text.replace("YES", "NO");
        assert_eq!(parse_w1_slave(&bad_crc), None);
        assert_eq!(parse_w1_slave("garbage"), None);
    }

    #[tokio::test]
    async fn reads_from_sysfs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1_slave");
        std::fs::write(&path, "xx : crc=aa YES\nxx t=-1250\n").unwrap();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let reporter = SensorReporter::new(
            "piwnica",
            "Piwnica",
            Some("°C".to_string()),
            Vec::new(),
            "boneio",
            Arc::new(bus),
            event_bus.clone(),
        );
        let sensor = DallasSensor::with_path(reporter, path);
        assert_eq!(sensor.read().unwrap(), -1.25);
        event_bus.close();
    }
}
