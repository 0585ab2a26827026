//! PSD container handling

pub mod composite;
pub mod header;
pub mod merged;

pub use composite::{composite, flatten_onto_white, Composite};
pub use header::{exif_orientation, find_image_resource, PsdHeader};
pub use merged::decode_merged;
