pub mod dma;

pub use dma::{
    DmaBuffer, DmaConstraints, DmaDirection, DmaError, DmaOps, SgElem, MAX_PRP_ENTRIES,
    MAX_TRANSFER_SIZE, PAGE_MASK, PAGE_SIZE,
};
