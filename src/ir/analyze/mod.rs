pub mod alias;
pub mod dom;
pub mod known_bits;
pub mod scev;
