pub mod heap;
pub mod simulate;
