mod decoder;

pub use decoder::X64;
