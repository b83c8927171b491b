//! Frame capture contract: RGB565 frames, the double-buffered exchange
//! between capture and inference, and the sensor loop that feeds it.

pub mod camera;
pub mod exchange;
pub mod types;

pub use camera::{
    CAPTURE_PERIOD, CameraReader, FrameReady, FrameSource, SENSOR_HEIGHT, SENSOR_WIDTH,
    SensorPattern, SyntheticSensor,
};
pub use exchange::{CaptureStats, FrameExchange, FrameLease, PublishOutcome};
pub use types::{CaptureError, Frame, FrameFormat, RGB565_BYTES, pack_rgb565, unpack_rgb565};
