// This module implements the executable memory manager. Memory is obtained from the OS in
// page-aligned chunks with mmap (a multiple of the page size, at least the configured chunk
// size) and each chunk is carved into variable-sized blocks. Blocks are handed out first-fit,
// split when a free block is larger than the request, and coalesced with free neighbours when
// released; chunks themselves are never merged. Every block is rounded up to whole pages, so
// no two blocks share a page and protection is changed per block: a block is writable from
// allocation until its code has been copied in, then read+execute, and writable again once
// released. Every chunk is unmapped when the allocator is dropped, which invalidates all code
// pointers handed out from it.

//! Executable memory: page-aligned chunks subdivided into code blocks.

use std::ptr::NonNull;

use crate::core::error::CodeAllocError;

/// One region inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRec {
    offset: usize,
    size: usize,
    free: bool,
}

/// A mapped region of executable memory.
#[derive(Debug)]
struct Chunk {
    base: NonNull<u8>,
    size: usize,
    /// Blocks sorted by offset, covering the whole chunk.
    blocks: Vec<BlockRec>,
}

impl Chunk {
    fn map(size: usize) -> Result<Self, CodeAllocError> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CodeAllocError::MapFailed {
                size,
                errno: last_errno(),
            });
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(CodeAllocError::MapFailed { size, errno: 0 })?;

        log::debug!("Mapped code chunk at {:p} ({} bytes)", base.as_ptr(), size);
        Ok(Self {
            base,
            size,
            blocks: vec![BlockRec {
                offset: 0,
                size,
                free: true,
            }],
        })
    }

    /// First-fit carve of `size` bytes; returns the block offset.
    fn carve(&mut self, size: usize) -> Option<usize> {
        let pos = self.blocks.iter().position(|b| b.free && b.size >= size)?;
        let block = self.blocks[pos];
        self.blocks[pos] = BlockRec {
            offset: block.offset,
            size,
            free: false,
        };
        if block.size > size {
            self.blocks.insert(
                pos + 1,
                BlockRec {
                    offset: block.offset + size,
                    size: block.size - size,
                    free: true,
                },
            );
        }
        Some(block.offset)
    }

    /// Mark the block at `offset` free and merge it with free neighbours.
    fn release(&mut self, offset: usize) -> bool {
        let Some(mut pos) = self.blocks.iter().position(|b| b.offset == offset && !b.free) else {
            return false;
        };
        self.blocks[pos].free = true;

        if pos + 1 < self.blocks.len() && self.blocks[pos + 1].free {
            let next = self.blocks.remove(pos + 1);
            self.blocks[pos].size += next.size;
        }
        if pos > 0 && self.blocks[pos - 1].free {
            let cur = self.blocks.remove(pos);
            pos -= 1;
            self.blocks[pos].size += cur.size;
        }
        true
    }

    fn free_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.free).map(|b| b.size).sum()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `Chunk::map` and is unmapped once.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

/// A block of code memory handed out by [`CodeAlloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlock {
    chunk: usize,
    offset: usize,
    size: usize,
    ptr: NonNull<u8>,
}

impl CodeBlock {
    /// Start of the block.
    pub fn start(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Usable size in bytes (whole pages).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` falls inside this block.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.size
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), CodeAllocError> {
        // SAFETY: the block covers whole pages of a mapping owned by the allocator.
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, prot) };
        if rc != 0 {
            return Err(CodeAllocError::ProtectFailed {
                addr: self.ptr.as_ptr() as usize,
                errno: last_errno(),
            });
        }
        Ok(())
    }
}

/// Executable memory manager.
pub struct CodeAlloc {
    chunk_size: usize,
    page_size: usize,
    chunks: Vec<Chunk>,
}

impl CodeAlloc {
    /// Create an allocator whose chunks are at least `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        let page_size = page_size();
        Self {
            chunk_size: align_up(chunk_size.max(page_size), page_size),
            page_size,
            chunks: Vec::new(),
        }
    }

    /// Allocate a writable block of at least `size` bytes.
    ///
    /// The block starts on a page boundary and spans whole pages.
    pub fn alloc(&mut self, size: usize) -> Result<CodeBlock, CodeAllocError> {
        if size == 0 {
            return Err(CodeAllocError::EmptyBlock);
        }
        let size = align_up(size, self.page_size);

        let found = self
            .chunks
            .iter_mut()
            .enumerate()
            .find_map(|(idx, chunk)| chunk.carve(size).map(|off| (idx, off)));

        let (chunk_idx, offset) = match found {
            Some(hit) => hit,
            None => {
                let mut chunk = Chunk::map(size.max(self.chunk_size))?;
                let offset = chunk.carve(size).ok_or(CodeAllocError::EmptyBlock)?;
                self.chunks.push(chunk);
                (self.chunks.len() - 1, offset)
            }
        };

        let chunk = &self.chunks[chunk_idx];
        // SAFETY: offset + size lies within the chunk mapping.
        let ptr = unsafe { NonNull::new_unchecked(chunk.base.as_ptr().add(offset)) };

        log::trace!("Code block {:p} ({} bytes) in chunk {}", ptr.as_ptr(), size, chunk_idx);
        Ok(CodeBlock {
            chunk: chunk_idx,
            offset,
            size,
            ptr,
        })
    }

    /// Copy `code` into a fresh block and make that block executable.
    pub fn install(&mut self, code: &[u8]) -> Result<CodeBlock, CodeAllocError> {
        let block = self.alloc(code.len())?;
        // SAFETY: the block is at least code.len() bytes and still writable.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), block.ptr.as_ptr(), code.len());
        }
        if let Err(err) = block.protect(libc::PROT_READ | libc::PROT_EXEC) {
            self.free(block);
            return Err(err);
        }
        log::trace!(
            "Installed {} bytes at {:p} (chunk {})",
            code.len(),
            block.start(),
            block.chunk
        );
        Ok(block)
    }

    /// Return a block to its chunk, coalescing adjacent free blocks. The
    /// block's pages become writable again.
    ///
    /// Returns false when the block was not live.
    pub fn free(&mut self, block: CodeBlock) -> bool {
        let Some(chunk) = self.chunks.get_mut(block.chunk) else {
            return false;
        };
        if !chunk.release(block.offset) {
            return false;
        }
        if let Err(err) = block.protect(libc::PROT_READ | libc::PROT_WRITE) {
            log::warn!("released code block stays protected: {}", err);
        }
        log::trace!("Released code block {:p} ({} bytes)", block.start(), block.size);
        true
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn free_bytes(&self) -> usize {
        self.chunks.iter().map(Chunk::free_bytes).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl std::fmt::Debug for CodeAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeAlloc")
            .field("chunks", &self.chunk_count())
            .field("total_bytes", &self.total_bytes())
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
