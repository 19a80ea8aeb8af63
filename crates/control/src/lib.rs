//! Host-side control of a CoreXY pen plotter.
//!
//! Every call that touches the device goes through a [`CommandQueue`], which
//! runs them one at a time in submission order. [`Plotter`] sits on top of
//! that and does the bookkeeping: where the pen was last sent, how fast it
//! should go, and how long each move and pen transition takes to physically
//! finish.

mod driver;
mod error;
mod plotter;
pub mod queue;
pub mod sim;

pub use driver::Driver;
pub use error::{Error, Result};
pub use plotter::Plotter;
pub use queue::{CommandQueue, Completion};
