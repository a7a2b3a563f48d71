mod decoder;

pub use decoder::AArch64;
