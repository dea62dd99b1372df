mod annotate;
mod backend;
mod backends;
mod detector;
mod result;

pub use annotate::{annotate, label_text, load_label_font, ABSENT_COLOR, PRESENT_COLOR};
pub use backend::InferenceBackend;
pub use backends::{open_backend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use detector::{Detector, DetectorOutput};
pub use result::{non_max_suppression, BoundingBox, Detection, DetectionResult};
