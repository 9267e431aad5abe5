pub mod errors;
pub mod experiment;
pub mod observation;
pub mod study;
pub mod trial;

pub use errors::*;
pub use experiment::*;
pub use observation::*;
pub use study::*;
pub use trial::*;
