use common::Error;

/// Fixed-capacity byte block owned by a [`BufferPool`].
///
/// Blocks move by value: into the network side while an asynchronous read or
/// write is outstanding, back into the pool (or a ready set) on completion.
#[derive(Debug)]
pub struct Block {
    id: usize,
    data: Box<[u8]>,
}

impl Block {
    /// Slot index within the pool that allocated this block.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Per-session pool of blocks.
///
/// The pool only tracks the blocks it currently holds (free) and how many it
/// ever allocated (all). Blocks that are neither are on loan to the caller,
/// which keeps `allocated == free + loaned` by construction. The pool grows
/// lazily up to the limit given at each acquisition and never shrinks.
#[derive(Debug)]
pub struct BufferPool {
    block_size: usize,
    allocated: usize,
    free: Vec<Block>,
}

impl BufferPool {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            allocated: 0,
            free: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns a free block, allocates a new one while fewer than `limit`
    /// exist, or `None` when the pool is exhausted and the caller must wait
    /// for a block to be released.
    pub fn acquire_or_allocate(&mut self, limit: usize) -> Result<Option<Block>, Error> {
        if let Some(block) = self.free.pop() {
            return Ok(Some(block));
        }
        if self.allocated >= limit {
            return Ok(None);
        }
        self.allocate().map(Some)
    }

    pub fn release(&mut self, block: Block) {
        debug_assert!(block.id < self.allocated, "block from a foreign pool");
        self.free.push(block);
    }

    /// Number of blocks ever allocated.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    /// Number of blocks currently out of the pool.
    pub fn loaned(&self) -> usize {
        self.allocated - self.free.len()
    }

    /// All allocated blocks are back in the pool.
    pub fn is_idle(&self) -> bool {
        self.loaned() == 0
    }

    fn allocate(&mut self) -> Result<Block, Error> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.block_size).map_err(|err| {
            Error::Resource(format!(
                "unable to allocate {} byte transfer buffer: {err}",
                self.block_size
            ))
        })?;
        data.resize(self.block_size, 0);
        let block = Block {
            id: self.allocated,
            data: data.into_boxed_slice(),
        };
        self.allocated += 1;
        tracing::trace!(
            "allocated block {} ({} bytes)",
            block.id,
            self.block_size
        );
        Ok(block)
    }
}
