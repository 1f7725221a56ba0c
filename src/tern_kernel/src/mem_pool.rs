//! Fixed-block memory pools
//!
//! A pool carves a caller-provided arena into equally sized blocks and
//! keeps the free ones on a singly linked list threaded through the blocks
//! themselves. Freeing a block while a thread is waiting hands the block
//! directly to the head waiter without touching the free list, so
//! `outstanding blocks + free-list length == block count` holds at all
//! times.
use core::{fmt, mem, ptr};

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard},
    ctx,
    error::{
        CreateError, DeleteError, GetBlockError, NoExistError, QueryError, ReleaseBlockError,
    },
    thread, timeout,
    utils::{BufRegion, Init, ObjectMagic},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, Port, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// *Memory-pool control block* — the state data of a fixed-block pool.
/// Caller-provided `'static` storage; [`create`] initializes it in place.
pub struct MemPoolCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    /// The arena the blocks are carved from.
    arena: CpuLockCell<Traits, BufRegion<u8>>,

    /// Block size in bytes, rounded up to pointer alignment.
    block_size: CpuLockCell<Traits, usize>,

    block_count: CpuLockCell<Traits, usize>,

    /// Head of the free list, threaded through the blocks. Null when
    /// every block is allocated.
    free_list: CpuLockCell<Traits, *mut u8>,

    free_count: CpuLockCell<Traits, usize>,

    wait_queue: WaitQueue<Traits>,
}

// Safety: The raw pointers refer into the caller-provided arena, which is
// only touched inside the pool's critical section.
unsafe impl<Traits: Port> Send for MemPoolCb<Traits> {}
unsafe impl<Traits: Port> Sync for MemPoolCb<Traits> {}

impl<Traits: Port> Init for MemPoolCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        arena: Init::INIT,
        block_size: Init::INIT,
        block_count: Init::INIT,
        free_list: CpuLockCell::new(ptr::null_mut()),
        free_count: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for MemPoolCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemPoolCb")
            .field("self", &(self as *const _))
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("free_count", &self.free_count)
            .finish_non_exhaustive()
    }
}

fn pool_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    pool: &MemPoolCb<Traits>,
) -> Result<(), NoExistError> {
    if *pool.magic.read(&**lock) != ObjectMagic::MEM_POOL {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// Initialize a pool over `arena` with blocks of `block_size` bytes.
///
/// `block_size` is rounded up to pointer alignment (the free list is
/// threaded through the blocks); the arena must yield at least two blocks.
pub fn create<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
    arena: BufRegion<u8>,
    block_size: usize,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *pool.magic.read(&*lock) == ObjectMagic::MEM_POOL {
        return Err(CreateError::BadState);
    }

    const PTR_SIZE: usize = mem::size_of::<usize>();
    if block_size < PTR_SIZE {
        return Err(CreateError::BadParam);
    }
    let block_size = (block_size + PTR_SIZE - 1) & !(PTR_SIZE - 1);
    let block_count = arena.len() / block_size;
    if block_count < 2 {
        return Err(CreateError::BadParam);
    }

    // Thread the free list through the blocks
    let base = arena.as_ptr() as *mut u8;
    for i in 0..block_count {
        // Safety: Block `i` lies within the arena, which is valid per the
        // `BufRegion` contract
        unsafe {
            let block = base.add(i * block_size);
            let next = if i + 1 == block_count {
                ptr::null_mut()
            } else {
                base.add((i + 1) * block_size)
            };
            (block as *mut *mut u8).write(next);
        }
    }

    pool.arena.replace(&mut *lock, arena);
    pool.block_size.replace(&mut *lock, block_size);
    pool.block_count.replace(&mut *lock, block_count);
    pool.free_list.replace(&mut *lock, base);
    pool.free_count.replace(&mut *lock, block_count);
    pool.magic.replace(&mut *lock, ObjectMagic::MEM_POOL);
    Ok(())
}

/// Invalidate a pool, releasing all waiters with [`ResultCode::Deleted`].
///
/// [`ResultCode::Deleted`]: crate::ResultCode::Deleted
pub fn delete<Traits: KernelTraits>(pool: &'static MemPoolCb<Traits>) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    pool_cb_check(&mut lock, pool)?;

    pool.wait_queue.wake_up_all_deleted(&mut lock);
    pool.magic.replace(&mut *lock, ObjectMagic::NONE);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Pop a block from the free list, if any.
fn free_list_pop<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    pool: &MemPoolCb<Traits>,
) -> Option<*mut u8> {
    let block = *pool.free_list.read(&**lock);
    if block.is_null() {
        return None;
    }

    // Safety: Free blocks hold the next-block pointer in their first word
    let next = unsafe { (block as *mut *mut u8).read() };
    pool.free_list.replace(&mut **lock, next);

    let free = *pool.free_count.read(&**lock);
    pool.free_count.replace(&mut **lock, free - 1);

    Some(block)
}

/// Allocate one block.
///
/// `timeout` may be [`NO_WAIT`] (poll), a tick count, or [`WAIT_FOREVER`].
pub fn get<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
    timeout: Ticks,
) -> Result<*mut u8, GetBlockError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    pool_cb_check(&mut lock, pool)?;

    if let Some(block) = free_list_pop(&mut lock, pool) {
        return Ok(block);
    }

    if timeout == NO_WAIT {
        return Err(GetBlockError::Timeout);
    }

    ctx::expect_waitable_context::<Traits>()?;

    let payload = WaitPayload::PoolBlock { slot: Init::INIT };

    // A freeing thread hands its block directly to this thread through the
    // payload slot
    let result = if timeout == WAIT_FOREVER {
        pool.wait_queue.wait(&mut lock, payload)?
    } else {
        timeout::check_duration(timeout)?;
        pool.wait_queue.wait_timeout(&mut lock, payload, timeout)?
    };

    if let WaitPayload::PoolBlock { slot } = result {
        let block = slot.read(&*lock).get();
        debug_assert!(!block.is_null());
        Ok(block)
    } else {
        unreachable!()
    }
}

/// Return a block to the pool.
///
/// If a thread is waiting, the block is handed directly to the head waiter;
/// otherwise it's pushed onto the free list.
pub fn release<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
    block: *mut u8,
) -> Result<(), ReleaseBlockError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    pool_cb_check(&mut lock, pool)?;

    // The pointer must denote a block of this pool
    let arena = *pool.arena.read(&*lock);
    let block_size = *pool.block_size.read(&*lock);
    let offset = (block as usize).wrapping_sub(arena.as_ptr() as usize);
    if block.is_null()
        || offset >= *pool.block_count.read(&*lock) * block_size
        || offset % block_size != 0
    {
        return Err(ReleaseBlockError::BadParam);
    }

    let handed_off = pool.wait_queue.with_first_wait_payload(&mut lock, |payload, token| {
        match payload {
            Some(WaitPayload::PoolBlock { slot }) => {
                slot.read(token).set(block);
                true
            }
            Some(_) => unreachable!(),
            None => false,
        }
    });

    if handed_off {
        let woke = pool.wait_queue.wake_up_one(&mut lock);
        debug_assert!(woke);
        thread::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    if *pool.free_count.read(&*lock) >= *pool.block_count.read(&*lock) {
        // More releases than allocations
        return Err(ReleaseBlockError::Overflow);
    }

    let head = *pool.free_list.read(&*lock);
    // Safety: `block` lies within the arena, validated above
    unsafe {
        (block as *mut *mut u8).write(head);
    }
    pool.free_list.replace(&mut *lock, block);
    let free = *pool.free_count.read(&*lock);
    pool.free_count.replace(&mut *lock, free + 1);
    Ok(())
}

/// The number of free blocks.
pub fn free_count<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
) -> Result<usize, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    pool_cb_check(&mut lock, pool)?;
    Ok(*pool.free_count.read(&*lock))
}

/// The total number of blocks.
pub fn block_count<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
) -> Result<usize, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    pool_cb_check(&mut lock, pool)?;
    Ok(*pool.block_count.read(&*lock))
}
