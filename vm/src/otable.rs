use bitflags::bitflags;

use object::Oref;

use crate::control::Control;
use crate::data::Dataspace;

/// Sentinel object index of the top-level frame.
pub const OBJ_NONE: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u8 {
        /// The object has been called at least once this epoch.
        const TOUCHED = 0x01;
    }
}

/// A persistent object: program, mutable state, and the creation count
/// that object references are validated against.
pub struct Obj {
    pub name: String,
    /// Creation count; zero once destructed.
    pub count: u32,
    pub flags: ObjFlags,
    pub control: Box<Control>,
    pub data: Option<Box<Dataspace>>,
}

struct Snapshot {
    level: u16,
    len: usize,
    saved: Vec<(u32, ObjFlags)>,
}

/// The object table. Destruction is a generation bump: the slot keeps its
/// program, but the count goes to zero and every stored reference with the
/// old count reads as nil from then on. `odcount` is the global destruct
/// epoch used to lazily re-scan array contents.
pub struct ObjectTable {
    pub objects: Vec<Obj>,
    counter: u32,
    pub odcount: u32,
    planes: Vec<Snapshot>,
}

impl ObjectTable {
    pub fn new() -> Self {
        ObjectTable {
            objects: Vec::new(),
            counter: 0,
            odcount: 0,
            planes: Vec::new(),
        }
    }

    pub fn create(&mut self, name: &str, control: Control) -> u32 {
        self.counter += 1;
        let index = self.objects.len() as u32;
        self.objects.push(Obj {
            name: name.to_string(),
            count: self.counter,
            flags: ObjFlags::empty(),
            control: Box::new(control),
            data: None,
        });
        index
    }

    #[inline]
    pub fn obj(&self, index: u32) -> &Obj {
        &self.objects[index as usize]
    }

    #[inline]
    pub fn obj_mut(&mut self, index: u32) -> &mut Obj {
        &mut self.objects[index as usize]
    }

    /// A live reference to the object at `index`.
    pub fn oref(&self, index: u32) -> Oref {
        Oref { index, count: self.obj(index).count }
    }

    /// Whether a stored reference no longer matches the table.
    #[inline]
    pub fn destructed(&self, r: Oref) -> bool {
        self.objects[r.index as usize].count != r.count
    }

    pub fn destruct(&mut self, index: u32) {
        let obj = &mut self.objects[index as usize];
        obj.count = 0;
        self.odcount = self.odcount.wrapping_add(1);
    }

    // ── planes ────────────────────────────────────────────────────────

    /// Stage the table for an atomic region.
    pub fn new_plane(&mut self, level: u16) {
        self.planes.push(Snapshot {
            level,
            len: self.objects.len(),
            saved: self
                .objects
                .iter()
                .map(|o| (o.count, o.flags))
                .collect(),
        });
    }

    /// Keep the staged changes.
    pub fn commit_plane(&mut self, level: u16) {
        let s = self.planes.pop().expect("no object plane to commit");
        debug_assert_eq!(s.level, level);
    }

    /// Throw the staged changes away: counts and flags roll back, objects
    /// created inside the region disappear.
    pub fn discard_plane(&mut self, level: u16) {
        let s = self.planes.pop().expect("no object plane to discard");
        debug_assert_eq!(s.level, level);
        self.objects.truncate(s.len);
        for (obj, (count, flags)) in self.objects.iter_mut().zip(s.saved) {
            obj.count = count;
            obj.flags = flags;
        }
        self.odcount = self.odcount.wrapping_add(1);
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
