pub mod node;
pub mod object;
pub mod remote;
pub mod snapshot;
pub mod tree;
