//! edgegridd — assembles the store, sync engine, controller and agent
//! channel into one running control plane.

pub mod control_plane;

pub use control_plane::ControlPlane;
