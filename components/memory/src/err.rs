use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid heap size: total {total_size}, segment {segment_size}"))]
    InvalidHeapSize {
        total_size: u64,
        segment_size: u64,
        #[snafu(implicit)]
        location: Location,
    },

    // Recoverable: the caller evicts chunks or grows the heap.
    #[snafu(display("no segment has a free block for {size} bytes"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid allocation size {size}"))]
    InvalidAllocationSize {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("address 0x{address:X} is not a block"))]
    InvalidAddress {
        address: u64,
        #[snafu(implicit)]
        location: Location,
    },

    // Double free and use after free. Debug builds assert instead.
    #[snafu(display("block 0x{address:X} was already freed"))]
    FreedBlock {
        address: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "access of {len} bytes at offset {offset} overruns block 0x{address:X} of {size} bytes"
    ))]
    OutOfBounds {
        address: u64,
        offset: usize,
        len: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("custom state {state} does not fit the 2 bit tag"))]
    InvalidCustomState {
        state: u8,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to dump heap to {path}"))]
    Dump {
        path: String,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },
}

impl Error {
    pub fn is_out_of_memory(&self) -> bool { matches!(self, Error::OutOfMemory { .. }) }

    pub fn is_out_of_bounds(&self) -> bool { matches!(self, Error::OutOfBounds { .. }) }

    pub fn is_freed_block(&self) -> bool { matches!(self, Error::FreedBlock { .. }) }
}

pub type Result<T> = std::result::Result<T, Error>;
