// Checkpoint image directory
pub mod reader;
pub mod state;

pub use reader::{ImageDir, IMAGE_MAGIC, IMAGE_TYPE_STATE, STATE_IMAGE};
pub use state::{from_image, to_image, IMAGE_VERSION};
