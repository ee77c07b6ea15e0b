//! The two-pool allocator.
//!
//! Blocks carry a one-word header holding the size plus a one-byte kind tag
//! in the high bits. `free` reads the tag to find the owning pool; a block
//! with neither tag is corrupt and fatal.
//!
//! The static pool carves a current chunk and recycles frees through per-size
//! lists (small) and a sorted array of size-keyed lists (large). The dynamic
//! pool keeps boundary-tagged chunks inside linked system blocks: large free
//! chunks live in a top-down splay tree keyed by size and coalesce with free
//! neighbours, small chunks are carved from a dedicated arena and recycled
//! through per-size lists without coalescing.

use std::cell::RefCell;
use std::mem;
use std::panic::Location;
use std::ptr::{self, NonNull};

use crate::system;

/// Alignment of every block handed out.
pub const ALIGN: usize = 8;

const MAGIC_MASK: u64 = 0xff00_0000_0000_0000;
const SIZE_MASK: u64 = !MAGIC_MASK;
const STATIC_MAGIC: u64 = 0xc5 << 56;
const DYNAMIC_MAGIC: u64 = 0xc6 << 56;

const WORD: usize = mem::size_of::<u64>();

/// A free chunk. The size word doubles as the allocated-block header.
#[repr(C)]
struct Chunk {
    size: u64,
    next: *mut Chunk,
}

/// Extended header in debug builds: allocation site plus the live-list links
/// used by the purge leak report.
#[cfg(debug_assertions)]
#[repr(C)]
struct Header {
    size: u64,
    loc: &'static Location<'static>,
    prev: *mut Header,
    next: *mut Header,
}

/// Distance from the block header to the bytes handed to the caller.
#[cfg(debug_assertions)]
pub const OFFSET: usize = mem::size_of::<Header>();
#[cfg(not(debug_assertions))]
pub const OFFSET: usize = WORD;

// ── static pool parameters ────────────────────────────────────────────

const INIT_CHUNK: usize = 16384;
const SMALL_RANGE: usize = 256;
const SLIMIT: usize = SMALL_RANGE + OFFSET;
const SSMALL: usize = OFFSET + SMALL_RANGE / 8;
const SCHUNKS: usize = SMALL_RANGE / ALIGN - 1;
const LCHUNKS: usize = 16;

// ── dynamic pool parameters ───────────────────────────────────────────

const DSMALL: usize = 64;
const DLIMIT: usize = DSMALL + OFFSET;
const DCHUNKS: usize = DSMALL / ALIGN - 1;
// must fit inside a configured dynamic block with room to spare
const ARENA_CHUNK: usize = 8192;

/// Splay-tree node, overlaid on a free dynamic chunk.
#[repr(C)]
struct SpNode {
    size: u64,
    parent: *mut SpNode,
    left: *mut SpNode,
    right: *mut SpNode,
}

#[derive(Clone, Copy)]
struct Clist {
    size: usize,
    list: *mut Chunk,
}

#[inline(always)]
fn align_to(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

struct Mem {
    // static pool
    schunk: *mut Chunk,
    schunksz: usize,
    schunks: [*mut Chunk; SCHUNKS],
    lchunks: [Clist; LCHUNKS],
    nlc: usize,
    slist: *mut Chunk,
    slevel: i32,
    smemsize: u64,
    sblocks: Vec<(NonNull<u8>, usize)>,
    // dynamic pool
    dchunksz: usize,
    dtree: *mut SpNode,
    dlist: *mut u8,
    dchunks: [*mut Chunk; DCHUNKS],
    dchunk: *mut Chunk,
    dmemsize: u64,
    dmemused: u64,
    #[cfg(debug_assertions)]
    hlist: *mut Header,
}

thread_local! {
    static MEM: RefCell<Mem> = RefCell::new(Mem::new());
}

impl Mem {
    fn new() -> Self {
        Mem {
            schunk: ptr::null_mut(),
            schunksz: 0,
            schunks: [ptr::null_mut(); SCHUNKS],
            lchunks: [Clist { size: 0, list: ptr::null_mut() }; LCHUNKS],
            nlc: 0,
            slist: ptr::null_mut(),
            slevel: 0,
            smemsize: 0,
            sblocks: Vec::new(),
            dchunksz: 0,
            dtree: ptr::null_mut(),
            dlist: ptr::null_mut(),
            dchunks: [ptr::null_mut(); DCHUNKS],
            dchunk: ptr::null_mut(),
            dmemsize: 0,
            dmemused: 0,
            #[cfg(debug_assertions)]
            hlist: ptr::null_mut(),
        }
    }

    fn new_block(&mut self, size: usize) -> *mut Chunk {
        let p = system::newmem(size);
        self.sblocks.push((p, size));
        p.as_ptr() as *mut Chunk
    }

    // ── static pool ───────────────────────────────────────────────────

    /// Find the list of large static chunks of exactly `size`, optionally
    /// creating it. The array stays sorted by size.
    fn lchunk(&mut self, size: usize, create: bool) -> Option<usize> {
        let mut l = 0;
        let mut m = 0;
        let mut h = self.nlc;
        while l < h {
            m = (l + h) >> 1;
            if self.lchunks[m].size == size {
                return Some(m);
            } else if self.lchunks[m].size > size {
                h = m;
            } else {
                m += 1;
                l = m;
            }
        }

        if !create {
            return None;
        }
        if self.nlc == LCHUNKS {
            panic!("too many different large static chunks");
        }
        let mut i = self.nlc;
        self.nlc += 1;
        while i > m {
            self.lchunks[i] = self.lchunks[i - 1];
            i -= 1;
        }
        self.lchunks[m] = Clist { size, list: ptr::null_mut() };
        Some(m)
    }

    unsafe fn salloc(&mut self, size: usize) -> *mut Chunk {
        // try the free lists first
        if size >= SLIMIT {
            if let Some(i) = self.lchunk(size, false) {
                let c = self.lchunks[i].list;
                if !c.is_null() {
                    self.lchunks[i].list = (*c).next;
                    return c;
                }
            }
        } else {
            let i = (size - OFFSET) / ALIGN - 1;
            let c = self.schunks[i];
            if !c.is_null() {
                self.schunks[i] = (*c).next;
                return c;
            }
        }

        // try the list of retired chunks
        if !self.slist.is_null() && (*self.slist).size as usize >= size {
            let c = self.slist;
            if (*c).size as usize - size <= OFFSET {
                // remainder is too small to keep
                self.slist = (*c).next;
            } else {
                let n = (c as *mut u8).add(size) as *mut Chunk;
                (*n).size = (*c).size - size as u64;
                if (*n).size as usize <= SSMALL {
                    let i = ((*n).size as usize - OFFSET) / ALIGN - 1;
                    (*n).next = self.schunks[i];
                    self.schunks[i] = n;
                    self.slist = (*c).next;
                } else {
                    (*n).next = (*c).next;
                    self.slist = n;
                }
                (*c).size = size as u64;
            }
            return c;
        }

        // carve from the current chunk
        if self.schunk.is_null()
            || ((*self.schunk).size as usize) < size && self.schunksz != 0
        {
            if !self.schunk.is_null() {
                (*self.schunk).next = self.slist;
                self.slist = self.schunk;
            }
            self.schunk = self.new_block(INIT_CHUNK);
            (*self.schunk).size = INIT_CHUNK as u64;
            self.smemsize += INIT_CHUNK as u64;
            if self.schunksz != 0 {
                tracing::warn!(
                    "ran out of static memory (increase the static chunk size)"
                );
            }
        }
        if (*self.schunk).size as usize >= size {
            let c = self.schunk;
            if (*c).size as usize - size <= OFFSET {
                self.schunk = ptr::null_mut();
            } else {
                let rest = (*c).size - size as u64;
                self.schunk = (c as *mut u8).add(size) as *mut Chunk;
                (*self.schunk).size = rest;
                if rest as usize <= SSMALL {
                    let i = (rest as usize - OFFSET) / ALIGN - 1;
                    (*self.schunk).next = self.schunks[i];
                    self.schunks[i] = self.schunk;
                    self.schunk = ptr::null_mut();
                }
                (*c).size = size as u64;
            }
            return c;
        }

        // oversized request, give it its own block
        let c = self.new_block(size);
        (*c).size = size as u64;
        self.smemsize += size as u64;
        c
    }

    unsafe fn sfree(&mut self, c: *mut Chunk) {
        let size = (*c).size as usize;
        if size < SLIMIT {
            let i = (size - OFFSET) / ALIGN - 1;
            (*c).next = self.schunks[i];
            self.schunks[i] = c;
        } else {
            let i = self.lchunk(size, true).unwrap();
            (*c).next = self.lchunks[i].list;
            self.lchunks[i].list = c;
        }
    }

    // ── splay tree of large free dynamic chunks ───────────────────────

    unsafe fn insert(&mut self, c: *mut SpNode) {
        let mut n = self.dtree;
        let t = c;
        self.dtree = t;
        (*t).parent = ptr::null_mut();

        if n.is_null() {
            // first in the tree
            (*t).left = ptr::null_mut();
            (*t).right = ptr::null_mut();
            return;
        }

        let size = (*t).size;
        let mut l = t;
        let mut r = t;

        loop {
            if (*n).size < size {
                let t2 = (*n).right;
                if t2.is_null() {
                    (*l).right = n;
                    (*n).parent = l;
                    (*r).left = ptr::null_mut();
                    break;
                }
                if (*t2).size >= size {
                    (*l).right = n;
                    (*n).parent = l;
                    l = n;
                    n = t2;
                    continue;
                }
                // rotate
                (*n).right = (*t2).left;
                if !(*n).right.is_null() {
                    (*(*t2).left).parent = n;
                }
                (*t2).left = n;
                (*n).parent = t2;
                (*l).right = t2;
                (*t2).parent = l;
                l = t2;
                n = (*t2).right;
                if n.is_null() {
                    (*r).left = ptr::null_mut();
                    break;
                }
            } else {
                let t2 = (*n).left;
                if t2.is_null() {
                    (*r).left = n;
                    (*n).parent = r;
                    (*l).right = ptr::null_mut();
                    break;
                }
                if (*t2).size < size {
                    (*r).left = n;
                    (*n).parent = r;
                    r = n;
                    n = t2;
                    continue;
                }
                // rotate
                (*n).left = (*t2).right;
                if !(*n).left.is_null() {
                    (*(*t2).right).parent = n;
                }
                (*t2).right = n;
                (*n).parent = t2;
                (*r).left = t2;
                (*t2).parent = r;
                r = t2;
                n = (*t2).left;
                if n.is_null() {
                    (*l).right = ptr::null_mut();
                    break;
                }
            }
        }

        // exchange left and right subtree
        let n = self.dtree;
        let t = (*n).left;
        (*n).left = (*n).right;
        (*n).right = t;
    }

    /// Find the smallest free chunk whose size is at least `size`, splaying
    /// it to the root. Returns null if every chunk is too small.
    unsafe fn seek(&mut self, size: u64) -> *mut Chunk {
        let mut n = self.dtree;
        if n.is_null() {
            return ptr::null_mut();
        }

        let mut dummy = SpNode {
            size: 0,
            parent: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
        };
        let dum = &mut dummy as *mut SpNode;
        let mut l = dum;
        let mut r = dum;

        loop {
            if (*n).size < size {
                let t = (*n).right;
                if t.is_null() {
                    (*l).right = n;
                    (*n).parent = l;
                    if r == dum {
                        // all chunks are too small
                        self.dtree = dummy.right;
                        (*self.dtree).parent = ptr::null_mut();
                        return ptr::null_mut();
                    }
                    (*(*r).parent).left = (*r).right;
                    if !(*r).right.is_null() {
                        (*(*r).right).parent = (*r).parent;
                    }
                    n = r;
                    break;
                }
                if (*t).size >= size {
                    (*l).right = n;
                    (*n).parent = l;
                    l = n;
                    n = t;
                    continue;
                }
                // rotate
                (*n).right = (*t).left;
                if !(*n).right.is_null() {
                    (*(*t).left).parent = n;
                }
                (*t).left = n;
                (*n).parent = t;
                (*l).right = t;
                (*t).parent = l;
                l = t;
                n = (*t).right;
                if n.is_null() {
                    if r == dum {
                        // all chunks are too small
                        self.dtree = dummy.right;
                        (*self.dtree).parent = ptr::null_mut();
                        return ptr::null_mut();
                    }
                    (*(*r).parent).left = (*r).right;
                    if !(*r).right.is_null() {
                        (*(*r).right).parent = (*r).parent;
                    }
                    n = r;
                    break;
                }
            } else {
                let t = (*n).left;
                if t.is_null() {
                    (*r).left = (*n).right;
                    if !(*r).left.is_null() {
                        (*(*n).right).parent = r;
                    }
                    (*l).right = ptr::null_mut();
                    break;
                }
                if (*t).size < size {
                    (*r).left = n;
                    (*n).parent = r;
                    r = n;
                    n = t;
                    continue;
                }
                // rotate
                (*n).left = (*t).right;
                if !(*n).left.is_null() {
                    (*(*t).right).parent = n;
                }
                if (*t).left.is_null() {
                    (*r).left = n;
                    (*n).parent = r;
                    (*l).right = ptr::null_mut();
                    n = t;
                    break;
                }
                (*t).right = n;
                (*n).parent = t;
                (*r).left = t;
                (*t).parent = r;
                r = t;
                n = (*t).left;
            }
        }

        (*n).parent = ptr::null_mut();
        (*n).right = dummy.left;
        if !(*n).right.is_null() {
            (*dummy.left).parent = n;
        }
        (*n).left = dummy.right;
        if !(*n).left.is_null() {
            (*dummy.right).parent = n;
        }

        self.dtree = n;
        n as *mut Chunk
    }

    unsafe fn delete(&mut self, c: *mut SpNode) {
        let n = c;
        let p = (*n).parent;

        if (*n).left.is_null() {
            // there is no left subtree
            if p.is_null() {
                self.dtree = (*n).right;
                if !self.dtree.is_null() {
                    (*self.dtree).parent = ptr::null_mut();
                }
            } else if n == (*p).left {
                (*p).left = (*n).right;
                if !(*p).left.is_null() {
                    (*(*p).left).parent = p;
                }
            } else {
                (*p).right = (*n).right;
                if !(*p).right.is_null() {
                    (*(*p).right).parent = p;
                }
            }
        } else {
            let mut t = (*n).left;

            // walk to the right in the left subtree
            loop {
                let r = (*t).right;
                if r.is_null() {
                    break;
                }
                (*t).right = (*r).left;
                if !(*t).right.is_null() {
                    (*(*r).left).parent = t;
                }
                (*r).left = t;
                (*t).parent = r;
                t = r;
            }

            if p.is_null() {
                self.dtree = t;
            } else if n == (*p).left {
                (*p).left = t;
            } else {
                (*p).right = t;
            }
            (*t).parent = p;
            (*t).right = (*n).right;
            if !(*t).right.is_null() {
                (*(*t).right).parent = t;
            }
        }
    }

    // ── dynamic pool ──────────────────────────────────────────────────

    unsafe fn dalloc(&mut self, mut size: usize) -> *mut Chunk {
        if self.dchunksz == 0 {
            // not initialized yet, fall through to the system
            let c = system::newmem(size).as_ptr() as *mut Chunk;
            (*c).size = size as u64;
            return c;
        }

        if size < DLIMIT {
            // small chunk
            let i = (size - OFFSET) / ALIGN - 1;
            let c = self.dchunks[i];
            if !c.is_null() {
                self.dchunks[i] = (*c).next;
                return c;
            }
            if self.dchunk.is_null() {
                // carve a fresh arena out of the large-chunk machinery
                let arena = self.dalloc(ARENA_CHUNK);
                let inner =
                    (arena as *mut u8).add(align_to(WORD)) as *mut Chunk;
                (*inner).size =
                    (*arena).size - align_to(WORD) as u64 - WORD as u64;
                // the arena block itself stays tagged so neighbours
                // never coalesce across it
                (*arena).size |= DYNAMIC_MAGIC;
                self.dchunk = inner;
            }
            let sz = (*self.dchunk).size as usize - size;
            let c = self.dchunk;
            (*c).size = size as u64;
            if sz >= DLIMIT - ALIGN {
                // enough is left for another small chunk
                self.dchunk = (c as *mut u8).add(size) as *mut Chunk;
                (*self.dchunk).size = sz as u64;
            } else {
                self.dchunk = ptr::null_mut();
            }
            return c;
        }

        // large chunks carry a trailing size word
        size += WORD;
        let mut c = self.seek(size as u64);
        if !c.is_null() {
            self.delete(c as *mut SpNode);
        } else {
            // get a new system block
            let p = system::newmem(self.dchunksz).as_ptr();
            self.dmemsize += self.dchunksz as u64;
            *(p as *mut *mut u8) = self.dlist;
            self.dlist = p;
            let p = p.add(mem::size_of::<*mut u8>());
            // no previous chunk
            *(p as *mut u64) = 0;
            c = p.add(WORD) as *mut Chunk;
            let csize =
                self.dchunksz - 2 * WORD - mem::size_of::<*mut u8>();
            (*c).size = csize as u64;
            let p = (c as *mut u8).add(csize - WORD);
            *(p as *mut u64) = csize as u64;
            // no following chunk
            *(p.add(WORD) as *mut u64) = 0;

            if csize < size {
                panic!("dynamic chunk size too small");
            }
        }

        let sz = (*c).size as usize - size;
        if sz >= DLIMIT + WORD {
            // split, second part goes back into the tree
            (*c).size = size as u64;
            let p = (c as *mut u8).add(size - WORD);
            *(p as *mut u64) = size as u64;
            let n = p.add(WORD) as *mut Chunk;
            (*n).size = sz as u64;
            *((n as *mut u8).add(sz - WORD) as *mut u64) = sz as u64;
            self.insert(n as *mut SpNode);
        }
        c
    }

    unsafe fn dfree(&mut self, mut c: *mut Chunk) {
        if self.dchunksz == 0 {
            let size = (*c).size as usize;
            system::delmem(NonNull::new_unchecked(c as *mut u8), size);
            return;
        }

        if ((*c).size as usize) < DLIMIT {
            // small chunk
            let i = ((*c).size as usize - OFFSET) / ALIGN - 1;
            (*c).next = self.dchunks[i];
            self.dchunks[i] = c;
            return;
        }

        let mut p = (c as *mut u8).sub(WORD);
        if *(p as *mut u64) != 0 {
            p = p.sub(*(p as *mut u64) as usize - WORD);
            if (*(p as *mut Chunk)).size & MAGIC_MASK == 0 {
                // merge with previous chunk
                self.delete(p as *mut SpNode);
                (*(p as *mut Chunk)).size += (*c).size;
                c = p as *mut Chunk;
                *((c as *mut u8).add((*c).size as usize - WORD) as *mut u64) =
                    (*c).size;
            }
        }
        let p = (c as *mut u8).add((*c).size as usize);
        if *(p as *mut u64) != 0
            && (*(p as *mut Chunk)).size & MAGIC_MASK == 0
        {
            // merge with next chunk
            self.delete(p as *mut SpNode);
            (*c).size += (*(p as *mut Chunk)).size;
            *((c as *mut u8).add((*c).size as usize - WORD) as *mut u64) =
                (*c).size;
        }

        self.insert(c as *mut SpNode);
    }

    // ── public operations ─────────────────────────────────────────────

    unsafe fn alloc_inner(
        &mut self,
        size: usize,
        loc: &'static Location<'static>,
    ) -> NonNull<u8> {
        let _ = loc;
        #[cfg(debug_assertions)]
        if size == 0 {
            panic!("alloc(0)");
        }
        let mut size = align_to(size + OFFSET);
        if size < mem::size_of::<Chunk>() {
            size = mem::size_of::<Chunk>();
        }
        let c;
        if self.slevel > 0 {
            c = self.salloc(size);
            (*c).size |= STATIC_MAGIC;
        } else {
            c = self.dalloc(size);
            self.dmemused += (*c).size;
            (*c).size |= DYNAMIC_MAGIC;
            #[cfg(debug_assertions)]
            {
                let h = c as *mut Header;
                (*h).prev = ptr::null_mut();
                (*h).next = self.hlist;
                if !self.hlist.is_null() {
                    (*self.hlist).prev = h;
                }
                self.hlist = h;
            }
        }
        #[cfg(debug_assertions)]
        {
            (*(c as *mut Header)).loc = loc;
        }
        NonNull::new_unchecked((c as *mut u8).add(OFFSET))
    }

    unsafe fn free_inner(&mut self, p: NonNull<u8>) {
        let c = p.as_ptr().sub(OFFSET) as *mut Chunk;
        match (*c).size & MAGIC_MASK {
            STATIC_MAGIC => {
                (*c).size &= SIZE_MASK;
                self.sfree(c);
            }
            DYNAMIC_MAGIC => {
                (*c).size &= SIZE_MASK;
                self.dmemused -= (*c).size;
                #[cfg(debug_assertions)]
                {
                    let h = c as *mut Header;
                    if !(*h).next.is_null() {
                        (*(*h).next).prev = (*h).prev;
                    }
                    if h == self.hlist {
                        self.hlist = (*h).next;
                    } else {
                        (*(*h).prev).next = (*h).next;
                    }
                }
                self.dfree(c);
            }
            _ => panic!("bad pointer in free"),
        }
    }

    unsafe fn purge_inner(&mut self) {
        #[cfg(debug_assertions)]
        while !self.hlist.is_null() {
            let h = self.hlist;
            let mut n = ((*h).size & SIZE_MASK) as usize - OFFSET;
            if n >= DLIMIT {
                n -= WORD;
            }
            let mem = (h as *mut u8).add(OFFSET);
            let head = std::slice::from_raw_parts(mem, n.min(26));
            tracing::warn!(
                size = n,
                at = %(*h).loc,
                bytes = ?head,
                "dynamic allocation leaked across purge"
            );
            self.free_inner(NonNull::new_unchecked(mem));
        }

        self.dchunks = [ptr::null_mut(); DCHUNKS];
        self.dchunk = ptr::null_mut();
        self.dtree = ptr::null_mut();
        while !self.dlist.is_null() {
            let p = self.dlist;
            self.dlist = *(p as *mut *mut u8);
            system::delmem(NonNull::new_unchecked(p), self.dchunksz);
        }
        self.dmemsize = 0;
        self.dmemused = 0;
    }

    unsafe fn minit_inner(&mut self, ssz: usize, dsz: usize) {
        self.schunksz = ssz;
        self.dchunksz = dsz;
        if !self.schunk.is_null() {
            (*self.schunk).next = self.slist;
            self.slist = self.schunk;
        }
        self.schunk = self.new_block(ssz);
        (*self.schunk).size = ssz as u64;
        self.smemsize += ssz as u64;
    }

    unsafe fn expand_inner(&mut self) {
        if !self.schunk.is_null() {
            (*self.schunk).next = self.slist;
            self.slist = self.schunk;
        }
        self.schunk = self.new_block(self.schunksz);
        (*self.schunk).size = self.schunksz as u64;
        self.smemsize += self.schunksz as u64;
    }
}

impl Drop for Mem {
    fn drop(&mut self) {
        unsafe {
            while !self.dlist.is_null() {
                let p = self.dlist;
                self.dlist = *(p as *mut *mut u8);
                system::delmem(NonNull::new_unchecked(p), self.dchunksz);
            }
            for (p, size) in self.sblocks.drain(..) {
                system::delmem(p, size);
            }
        }
    }
}

/// Install the configured chunk sizes for both pools.
pub fn minit(static_chunk: usize, dynamic_chunk: usize) {
    MEM.with(|m| unsafe {
        m.borrow_mut().minit_inner(static_chunk, dynamic_chunk)
    });
}

/// Allocate `size` bytes from the pool selected by the current mode.
#[track_caller]
pub fn alloc(size: usize) -> NonNull<u8> {
    let loc = Location::caller();
    MEM.with(|m| unsafe { m.borrow_mut().alloc_inner(size, loc) })
}

/// Release a block obtained from [`alloc`].
///
/// # Safety
///
/// `p` must come from [`alloc`] and must not be used afterwards.
pub unsafe fn free(p: NonNull<u8>) {
    MEM.with(|m| m.borrow_mut().free_inner(p));
}

/// Enter static mode. Calls nest.
pub fn mstatic() {
    MEM.with(|m| m.borrow_mut().slevel += 1);
}

/// Leave static mode.
pub fn mdynamic() {
    MEM.with(|m| m.borrow_mut().slevel -= 1);
}

/// Drop every dynamic chunk and reset the dynamic bookkeeping. In debug
/// builds, live dynamic allocations are reported as leaks first.
pub fn purge() {
    MEM.with(|m| unsafe { m.borrow_mut().purge_inner() });
}

/// Expand the static area by another configured chunk.
pub fn expand() {
    MEM.with(|m| unsafe { m.borrow_mut().expand_inner() });
}

/// Whether a full static chunk is still available.
pub fn check() -> bool {
    MEM.with(|m| {
        let m = m.borrow();
        if m.schunk.is_null() {
            false
        } else {
            unsafe { (*m.schunk).size as usize >= m.schunksz }
        }
    })
}

/// Total memory obtained from the system.
pub fn mem_size() -> u64 {
    MEM.with(|m| {
        let m = m.borrow();
        m.smemsize + m.dmemsize
    })
}

/// Memory in use (the static pool counts wholesale).
pub fn mem_used() -> u64 {
    MEM.with(|m| {
        let m = m.borrow();
        m.smemsize + m.dmemused
    })
}

/// Bytes currently handed out from the dynamic pool.
pub fn dynamic_used() -> u64 {
    MEM.with(|m| m.borrow().dmemused)
}

/// Whether [`minit`] has installed the pool sizes yet.
pub fn configured() -> bool {
    MEM.with(|m| m.borrow().dchunksz != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let configured = MEM.with(|m| m.borrow().dchunksz != 0);
        if !configured {
            minit(16384, 32768);
        }
    }

    #[test]
    fn static_round_trip() {
        init();
        mstatic();
        let p = alloc(100);
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xAB, 100);
            assert_eq!(*p.as_ptr(), 0xAB);
            free(p);
        }
        mdynamic();
    }

    #[test]
    fn small_dynamic_chunks_recycle() {
        init();
        let p = alloc(24);
        unsafe { free(p) };
        let q = alloc(24);
        assert_eq!(p, q);
        unsafe { free(q) };
    }

    #[test]
    fn dynamic_use_balances() {
        init();
        let before = dynamic_used();
        let mut blocks = Vec::new();
        for i in 1..40 {
            blocks.push(alloc(i * 17));
        }
        assert!(dynamic_used() > before);
        for p in blocks {
            unsafe { free(p) };
        }
        assert_eq!(dynamic_used(), before);
    }

    #[test]
    fn large_free_chunks_are_reused() {
        init();
        let p = alloc(3000);
        unsafe { free(p) };
        let size_after_free = mem_size();
        // a smaller request must be served from the freed chunk,
        // not from a fresh system block
        let q = alloc(2000);
        assert_eq!(mem_size(), size_after_free);
        unsafe { free(q) };
    }

    #[test]
    fn coalesced_neighbours_serve_bigger_requests() {
        init();
        let a = alloc(500);
        let b = alloc(500);
        let c = alloc(500);
        unsafe {
            free(a);
            free(c);
            free(b);
        }
        let size_before = mem_size();
        // all three merged back into one region, so a request larger
        // than any single one still needs no new system block
        let d = alloc(1400);
        assert_eq!(mem_size(), size_before);
        unsafe { free(d) };
    }

    #[test]
    fn purge_resets_dynamic_pool() {
        init();
        let _leak1 = alloc(100);
        let _leak2 = alloc(2000);
        assert!(dynamic_used() > 0);
        purge();
        assert_eq!(dynamic_used(), 0);
        // pool is usable again afterwards
        let p = alloc(64);
        unsafe { free(p) };
    }

    #[test]
    fn mode_counter_nests() {
        init();
        mstatic();
        mstatic();
        mdynamic();
        // still in static mode
        let before = dynamic_used();
        let p = alloc(48);
        assert_eq!(dynamic_used(), before);
        unsafe { free(p) };
        mdynamic();
    }

    #[test]
    fn static_area_expands_on_demand() {
        init();
        assert!(check());
        mstatic();
        // drain the current chunk, then grow the area by another one
        let p = alloc(16000);
        assert!(!check());
        expand();
        assert!(check());
        let q = alloc(8000);
        unsafe {
            free(p);
            free(q);
        }
        mdynamic();
        assert!(mem_size() >= 2 * 16384);
    }

    #[test]
    fn static_mode_survives_purge() {
        init();
        mstatic();
        let p = alloc(200);
        purge();
        // static allocations are untouched by purge
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0x5A, 200);
            free(p);
        }
        mdynamic();
    }
}
