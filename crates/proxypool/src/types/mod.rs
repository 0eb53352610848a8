mod proxy;

pub use proxy::*;
