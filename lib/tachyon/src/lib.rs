#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod client;
pub mod net;
pub mod predict;
pub mod server;
pub mod state;
pub mod stats;
pub mod zone;

pub mod prelude;
