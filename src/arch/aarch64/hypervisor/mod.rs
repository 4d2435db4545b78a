//! EL2 trap handling helpers

pub mod decode;
pub mod inject;
pub mod trap;
