//! Spaces and their lifecycle
//!
//! A space is a root tree (its id is the space id) plus app trees loaded on
//! demand. [`SpaceManager`] opens spaces on the layers a [`LayerFactory`]
//! provides and routes ops between trees and layers.

mod dispatch;
mod error;
mod factory;
mod manager;
mod model;

pub use dispatch::LayerErrorEvent;
pub use error::SpaceError;
pub use factory::{path_from_uri, FsLayerFactory, LayerFactory, StaticLayerFactory};
pub use manager::{SpaceHandle, SpaceManager, SpacePointer};
pub use model::{SharedTree, Space};
