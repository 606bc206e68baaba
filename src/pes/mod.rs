//! PEs and the VPEs scheduled onto them
//!
//! The per-PE context switcher is the heart of this subsystem: it runs the
//! six-state save/restore machine against the RCTMux agent. PeMng places
//! VPEs onto PEs, VpeMng owns them.

pub mod ctxsw;
pub mod loader;
pub mod pemng;
pub mod rctmux;
pub mod vpe;
pub mod vpemng;

pub use ctxsw::{ContextSwitcher, State, SwitchCtx};
pub use pemng::PeMng;
pub use vpe::{Vpe, VpeFlags, VpeState};
pub use vpemng::{VpeMng, MAX_VPES};
