//! Orientation resolution.
//!
//! Maps the physical device orientation and the active camera facing to one of
//! the eight EXIF orientation codes, and applies a code to a grayscale image so
//! it is presented upright before classification.

use image::{imageops, GrayImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Physical orientation of the device as reported by its motion sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceOrientation {
    Upright,
    UpsideDown,
    RotatedLeft,
    RotatedRight,
    FaceUp,
    FaceDown,
    Unknown,
}

/// Which way the active camera points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraFacing {
    Front,
    Back,
}

/// EXIF orientation: how a stored image must be transformed to display upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrientationCode {
    Up = 1,
    UpMirrored = 2,
    Down = 3,
    DownMirrored = 4,
    LeftMirrored = 5,
    Right = 6,
    RightMirrored = 7,
    Left = 8,
}

/// Resolve the orientation code for the current frame.
///
/// Total and side-effect free. Landscape orientations depend on the camera
/// facing because the front sensor is read out mirrored.
pub fn resolve(device: DeviceOrientation, facing: CameraFacing) -> OrientationCode {
    let front = facing == CameraFacing::Front;
    match device {
        DeviceOrientation::UpsideDown => OrientationCode::Left,
        DeviceOrientation::RotatedLeft if front => OrientationCode::Down,
        DeviceOrientation::RotatedLeft => OrientationCode::Up,
        DeviceOrientation::RotatedRight if front => OrientationCode::Up,
        DeviceOrientation::RotatedRight => OrientationCode::Down,
        _ => OrientationCode::Right,
    }
}

impl OrientationCode {
    pub const ALL: [OrientationCode; 8] = [
        OrientationCode::Up,
        OrientationCode::UpMirrored,
        OrientationCode::Down,
        OrientationCode::DownMirrored,
        OrientationCode::LeftMirrored,
        OrientationCode::Right,
        OrientationCode::RightMirrored,
        OrientationCode::Left,
    ];

    pub fn exif_value(self) -> u8 {
        self as u8
    }

    pub fn from_exif(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.exif_value() == value)
    }

    /// The code that undoes this one.
    pub fn inverse(self) -> Self {
        match self {
            OrientationCode::Right => OrientationCode::Left,
            OrientationCode::Left => OrientationCode::Right,
            other => other,
        }
    }

    /// Whether applying this code swaps width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            OrientationCode::LeftMirrored
                | OrientationCode::Right
                | OrientationCode::RightMirrored
                | OrientationCode::Left
        )
    }

    /// Return `image` transformed so it is presented upright.
    pub fn apply(self, image: &GrayImage) -> GrayImage {
        match self {
            OrientationCode::Up => image.clone(),
            OrientationCode::UpMirrored => imageops::flip_horizontal(image),
            OrientationCode::Down => imageops::rotate180(image),
            OrientationCode::DownMirrored => imageops::flip_vertical(image),
            OrientationCode::LeftMirrored => imageops::flip_horizontal(&imageops::rotate90(image)),
            OrientationCode::Right => imageops::rotate90(image),
            OrientationCode::RightMirrored => imageops::flip_vertical(&imageops::rotate90(image)),
            OrientationCode::Left => imageops::rotate270(image),
        }
    }

    fn name(self) -> &'static str {
        match self {
            OrientationCode::Up => "up",
            OrientationCode::UpMirrored => "up-mirrored",
            OrientationCode::Down => "down",
            OrientationCode::DownMirrored => "down-mirrored",
            OrientationCode::LeftMirrored => "left-mirrored",
            OrientationCode::Right => "right",
            OrientationCode::RightMirrored => "right-mirrored",
            OrientationCode::Left => "left",
        }
    }
}

impl fmt::Display for OrientationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.exif_value())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {kind}: {value:?}")]
pub struct OrientationParseError {
    kind: &'static str,
    value: String,
}

impl OrientationParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self { kind, value: value.to_string() }
    }
}

impl FromStr for OrientationCode {
    type Err = OrientationParseError;

    /// Accepts the kebab-case name (`"up-mirrored"`) or the EXIF number (`"2"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(n) = s.parse::<u8>() {
            return Self::from_exif(n).ok_or_else(|| OrientationParseError::new("orientation code", &s));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| OrientationParseError::new("orientation code", &s))
    }
}

impl FromStr for DeviceOrientation {
    type Err = OrientationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upright" | "portrait" => Ok(Self::Upright),
            "upside-down" | "portrait-upside-down" => Ok(Self::UpsideDown),
            "rotated-left" | "landscape-left" | "left" => Ok(Self::RotatedLeft),
            "rotated-right" | "landscape-right" | "right" => Ok(Self::RotatedRight),
            "face-up" => Ok(Self::FaceUp),
            "face-down" => Ok(Self::FaceDown),
            "unknown" => Ok(Self::Unknown),
            other => Err(OrientationParseError::new("device orientation", other)),
        }
    }
}

impl FromStr for CameraFacing {
    type Err = OrientationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" | "user" => Ok(Self::Front),
            "back" | "rear" | "environment" => Ok(Self::Back),
            other => Err(OrientationParseError::new("camera facing", other)),
        }
    }
}

/// Anything that can report the device's current physical orientation.
pub trait DeviceOrientationSource: Send {
    fn device_orientation(&self) -> DeviceOrientation;
}

/// A device that never moves.
#[derive(Debug, Clone, Copy)]
pub struct FixedDeviceOrientation(pub DeviceOrientation);

impl DeviceOrientationSource for FixedDeviceOrientation {
    fn device_orientation(&self) -> DeviceOrientation {
        self.0
    }
}

/// How the pipeline obtains the orientation code for each frame.
pub enum OrientationPolicy {
    /// Query the sensor and resolve on every call.
    Resolve {
        source: Box<dyn DeviceOrientationSource>,
        facing: CameraFacing,
    },
    /// The stream is already upright in a known way (e.g. a laptop webcam).
    Fixed(OrientationCode),
}

impl OrientationPolicy {
    /// Orientation code for the frame being processed right now.
    pub fn current(&self) -> OrientationCode {
        match self {
            OrientationPolicy::Resolve { source, facing } => {
                resolve(source.device_orientation(), *facing)
            }
            OrientationPolicy::Fixed(code) => *code,
        }
    }
}

impl fmt::Debug for OrientationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrientationPolicy::Resolve { facing, .. } => {
                f.debug_struct("Resolve").field("facing", facing).finish_non_exhaustive()
            }
            OrientationPolicy::Fixed(code) => f.debug_tuple("Fixed").field(code).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ALL_DEVICE: [DeviceOrientation; 7] = [
        DeviceOrientation::Upright,
        DeviceOrientation::UpsideDown,
        DeviceOrientation::RotatedLeft,
        DeviceOrientation::RotatedRight,
        DeviceOrientation::FaceUp,
        DeviceOrientation::FaceDown,
        DeviceOrientation::Unknown,
    ];

    #[test]
    fn test_resolve_table() {
        use CameraFacing::*;
        use DeviceOrientation::*;
        use OrientationCode as C;

        let table = [
            (Upright, Front, C::Right),
            (Upright, Back, C::Right),
            (UpsideDown, Front, C::Left),
            (UpsideDown, Back, C::Left),
            (RotatedLeft, Front, C::Down),
            (RotatedLeft, Back, C::Up),
            (RotatedRight, Front, C::Up),
            (RotatedRight, Back, C::Down),
        ];
        for (device, facing, expected) in table {
            assert_eq!(resolve(device, facing), expected, "{device:?} / {facing:?}");
        }
    }

    #[test]
    fn test_resolve_unlisted_orientations_fall_back() {
        for device in [DeviceOrientation::FaceUp, DeviceOrientation::FaceDown, DeviceOrientation::Unknown] {
            for facing in [CameraFacing::Front, CameraFacing::Back] {
                assert_eq!(resolve(device, facing), OrientationCode::Right);
            }
        }
    }

    #[test]
    fn test_resolve_is_pure() {
        for device in ALL_DEVICE {
            for facing in [CameraFacing::Front, CameraFacing::Back] {
                let first = resolve(device, facing);
                for _ in 0..10 {
                    assert_eq!(resolve(device, facing), first);
                }
            }
        }
    }

    #[test]
    fn test_facing_only_matters_in_landscape() {
        for device in ALL_DEVICE {
            let differs = resolve(device, CameraFacing::Front) != resolve(device, CameraFacing::Back);
            let landscape = matches!(
                device,
                DeviceOrientation::RotatedLeft | DeviceOrientation::RotatedRight
            );
            assert_eq!(differs, landscape, "{device:?}");
        }
    }

    #[test]
    fn test_exif_values() {
        let values: Vec<u8> = OrientationCode::ALL.iter().map(|c| c.exif_value()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(OrientationCode::from_exif(6), Some(OrientationCode::Right));
        assert_eq!(OrientationCode::from_exif(0), None);
        assert_eq!(OrientationCode::from_exif(9), None);
    }

    #[test]
    fn test_parse_code_by_name_and_number() {
        assert_eq!("up-mirrored".parse::<OrientationCode>(), Ok(OrientationCode::UpMirrored));
        assert_eq!("8".parse::<OrientationCode>(), Ok(OrientationCode::Left));
        assert_eq!(" Right ".parse::<OrientationCode>(), Ok(OrientationCode::Right));
        assert!("sideways".parse::<OrientationCode>().is_err());
        assert!("0".parse::<OrientationCode>().is_err());
    }

    #[test]
    fn test_parse_device_and_facing() {
        assert_eq!("landscape-left".parse::<DeviceOrientation>(), Ok(DeviceOrientation::RotatedLeft));
        assert_eq!("upside-down".parse::<DeviceOrientation>(), Ok(DeviceOrientation::UpsideDown));
        assert_eq!("rear".parse::<CameraFacing>(), Ok(CameraFacing::Back));
        assert!("diagonal".parse::<DeviceOrientation>().is_err());
        assert!("side".parse::<CameraFacing>().is_err());
    }

    /// 3x2 image with distinct pixel values 0..6 in row-major order.
    fn sample() -> GrayImage {
        GrayImage::from_fn(3, 2, |x, y| Luma([(y * 3 + x) as u8]))
    }

    fn pixels(img: &GrayImage) -> Vec<u8> {
        img.as_raw().clone()
    }

    #[test]
    fn test_apply_dimensions() {
        let img = sample();
        for code in OrientationCode::ALL {
            let out = code.apply(&img);
            if code.swaps_dimensions() {
                assert_eq!(out.dimensions(), (2, 3), "{code}");
            } else {
                assert_eq!(out.dimensions(), (3, 2), "{code}");
            }
        }
    }

    #[test]
    fn test_apply_known_layouts() {
        let img = sample();
        // 0 1 2
        // 3 4 5
        assert_eq!(pixels(&OrientationCode::Up.apply(&img)), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(pixels(&OrientationCode::UpMirrored.apply(&img)), vec![2, 1, 0, 5, 4, 3]);
        assert_eq!(pixels(&OrientationCode::Down.apply(&img)), vec![5, 4, 3, 2, 1, 0]);
        assert_eq!(pixels(&OrientationCode::DownMirrored.apply(&img)), vec![3, 4, 5, 0, 1, 2]);
        // clockwise quarter turn
        assert_eq!(pixels(&OrientationCode::Right.apply(&img)), vec![3, 0, 4, 1, 5, 2]);
        assert_eq!(pixels(&OrientationCode::Left.apply(&img)), vec![2, 5, 1, 4, 0, 3]);
        // transpose
        assert_eq!(pixels(&OrientationCode::LeftMirrored.apply(&img)), vec![0, 3, 1, 4, 2, 5]);
        // transverse
        assert_eq!(pixels(&OrientationCode::RightMirrored.apply(&img)), vec![5, 2, 4, 1, 3, 0]);
    }

    #[test]
    fn test_apply_inverse_restores_image() {
        let img = sample();
        for code in OrientationCode::ALL {
            let restored = code.inverse().apply(&code.apply(&img));
            assert_eq!(pixels(&restored), pixels(&img), "{code}");
            assert_eq!(restored.dimensions(), img.dimensions());
        }
    }

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        sequence: Vec<DeviceOrientation>,
    }

    impl DeviceOrientationSource for CountingSource {
        fn device_orientation(&self) -> DeviceOrientation {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.sequence[n % self.sequence.len()]
        }
    }

    #[test]
    fn test_policy_resolves_on_every_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = OrientationPolicy::Resolve {
            source: Box::new(CountingSource {
                calls: calls.clone(),
                sequence: vec![DeviceOrientation::RotatedLeft, DeviceOrientation::UpsideDown],
            }),
            facing: CameraFacing::Back,
        };

        assert_eq!(policy.current(), OrientationCode::Up);
        assert_eq!(policy.current(), OrientationCode::Left);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_policy_fixed() {
        let policy = OrientationPolicy::Fixed(OrientationCode::Down);
        assert_eq!(policy.current(), OrientationCode::Down);
        let fixed = OrientationPolicy::Resolve {
            source: Box::new(FixedDeviceOrientation(DeviceOrientation::Upright)),
            facing: CameraFacing::Front,
        };
        assert_eq!(fixed.current(), OrientationCode::Right);
    }
}
