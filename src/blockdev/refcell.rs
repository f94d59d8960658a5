//! A `RefCell<T>` wrapper so a single `BlockDevice` can be shared between
//! several owners that each only need `&self` access (e.g. more than one
//! open file over the same card).

use crate::block::{Block, BlockIdx};

use super::{BlockCount, BlockDevice};

impl<T> BlockDevice for core::cell::RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.num_blocks()
    }
}

impl<T> BlockDevice for &core::cell::RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.num_blocks()
    }
}
