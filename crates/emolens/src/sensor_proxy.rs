//! Device orientation from iio-sensor-proxy over the system bus.

use emolens_core::{DeviceOrientation, DeviceOrientationSource};
use std::time::Duration;

// Generates `IioSensorProxy` (async) and `IioSensorProxyBlocking`; only the
// blocking variant is used, from the work thread.
#[zbus::proxy(
    interface = "net.hadess.SensorProxy",
    default_service = "net.hadess.SensorProxy",
    default_path = "/net/hadess/SensorProxy"
)]
trait IioSensor {
    fn claim_accelerometer(&self) -> zbus::Result<()>;

    fn release_accelerometer(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn has_accelerometer(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn accelerometer_orientation(&self) -> zbus::Result<String>;
}

/// Map an iio-sensor-proxy orientation string to a device orientation.
pub fn parse_sensor_orientation(value: &str) -> DeviceOrientation {
    match value {
        "normal" => DeviceOrientation::Upright,
        "bottom-up" => DeviceOrientation::UpsideDown,
        "left-up" => DeviceOrientation::RotatedRight,
        "right-up" => DeviceOrientation::RotatedLeft,
        _ => DeviceOrientation::Unknown,
    }
}

/// Accelerometer claimed from iio-sensor-proxy for the lifetime of the value.
pub struct SensorProxyOrientation {
    proxy: IioSensorProxyBlocking<'static>,
}

impl SensorProxyOrientation {
    /// Connect to the system bus and claim the accelerometer.
    pub fn connect() -> zbus::Result<Self> {
        let conn = zbus::blocking::connection::Builder::system()?
            .method_timeout(Duration::from_secs(3))
            .build()?;
        let proxy = IioSensorProxyBlocking::new(&conn)?;

        if !proxy.has_accelerometer()? {
            return Err(zbus::Error::Failure("no accelerometer available".into()));
        }
        proxy.claim_accelerometer()?;
        tracing::info!(
            orientation = %proxy.accelerometer_orientation().unwrap_or_default(),
            "claimed accelerometer"
        );

        Ok(Self { proxy })
    }
}

impl DeviceOrientationSource for SensorProxyOrientation {
    fn device_orientation(&self) -> DeviceOrientation {
        match self.proxy.accelerometer_orientation() {
            Ok(value) => parse_sensor_orientation(&value),
            Err(e) => {
                tracing::debug!(error = %e, "accelerometer read failed");
                DeviceOrientation::Unknown
            }
        }
    }
}

impl Drop for SensorProxyOrientation {
    fn drop(&mut self) {
        if let Err(e) = self.proxy.release_accelerometer() {
            tracing::debug!(error = %e, "failed to release accelerometer");
        }
    }
}
