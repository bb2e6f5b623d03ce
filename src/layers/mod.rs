//! Concrete operations implementing [Layer](crate::Layer). The engine is
//! agnostic to this set; any operation that speaks the trait plugs into
//! the same wiring, dispatch and gradient machinery.

mod activation;
mod convolutional;
mod fully_connected;
mod max_pooling;

pub use activation::{Activation, ActivationKind};
pub use convolutional::Convolutional;
pub use fully_connected::FullyConnected;
pub use max_pooling::MaxPooling;
