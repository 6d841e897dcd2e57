//! # overlay-core: shared overlay data model
//!
//! The unit of synchronization is the [`ItemCollection`]: a map from item id
//! to [`Item`] (image, video or text block). Every client holds one local
//! copy; the authority holds the canonical one together with a
//! [`StateVersion`].
//!
//! ```text
//!  broadcast stream ──► Mutation ──► ItemCollection::apply ──► renderers
//!  snapshot         ──────────────► ItemCollection::replace_all
//! ```
//!
//! Nothing in this crate performs I/O. The network side lives in
//! `overlay-sync`.

pub mod checksum;
pub mod collection;
pub mod item;
pub mod version;

pub use checksum::state_checksum;
pub use collection::{Applied, ItemCollection, Mutation};
pub use item::{
    validate_property, Item, ItemError, ItemKind, Padding, Position, ShadowOffset, Size,
    TextStyle, CANVAS_SIZE,
};
pub use version::StateVersion;
