//! Persisted entity kinds and their column descriptors.

mod content;
mod media;
mod media_list;
mod profile;

pub use content::{Content, ContentTable, Messages, Posts, Stories};
pub use media::{Media, MediaSlot};
pub use media_list::MediaList;
pub use profile::{Profile, ProfileImage};
