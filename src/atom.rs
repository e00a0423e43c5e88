/// Atom table — interned identifier ids.
///
/// Identifiers are interned into 16-bit `Atom` ids. Ids below
/// `EXTERNAL_ATOM_OFFSET` refer to the compile-time table of shared atoms
/// (well-known names: `constructor`, `length`, library roots, ...); ids at
/// or above it index a growable byte pool of NUL-terminated user strings.
/// Interning is idempotent and equality is an integer compare. Atoms are
/// never removed; the table grows monotonically for the life of the
/// process.

use once_cell::sync::Lazy;

/// First id handed out for user-interned atoms. Everything below is a
/// shared atom.
pub const EXTERNAL_ATOM_OFFSET: u16 = 32768;

/// A 16-bit interned identifier. `Atom::NONE` (raw 0) is the "no atom"
/// sentinel; shared atoms start at raw 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Atom(u16);

impl Atom {
    pub const NONE: Atom = Atom(0);

    pub fn from_raw(raw: u16) -> Atom {
        Atom(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_shared(self) -> bool {
        self.0 != 0 && self.0 < EXTERNAL_ATOM_OFFSET
    }
}

impl From<SharedAtom> for Atom {
    fn from(sa: SharedAtom) -> Atom {
        Atom(sa as u16 + 1)
    }
}

/// Pre-defined atoms. Discriminants index `SHARED_ATOM_NAMES`, which must
/// stay sorted by name for the binary search in `AtomTable::atomize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SharedAtom {
    Array = 0,
    Global,
    Iterator,
    Json,
    Object,
    Once,
    Repeating,
    Timer,
    DunderIndex,
    DunderNativeObject,
    DunderObject,
    Arguments,
    Back,
    ConsoleListener,
    Constructor,
    CurrentTime,
    Delay,
    Done,
    Front,
    GetValue,
    IteratorProp, // "iterator", the property consulted by for-in
    Join,
    Length,
    Meminfo,
    Name,
    Next,
    Null,
    Parse,
    PopBack,
    PopFront,
    Print,
    Println,
    PushBack,
    PushFront,
    SetValue,
    Split,
    Start,
    Stop,
    Stringify,
    ToFloat,
    ToInt,
    ToString,
    ToUInt,
    Trim,
    Undefined,
    Value,
    WaitForEvent,
}

// One entry per `SharedAtom` variant, in discriminant order.
const SHARED_ATOM_NAMES: [&str; 47] = [
    "Array",
    "Global",
    "Iterator",
    "JSON",
    "Object",
    "Once",
    "Repeating",
    "Timer",
    "__index",
    "__nativeObject",
    "__object",
    "arguments",
    "back",
    "consoleListener",
    "constructor",
    "currentTime",
    "delay",
    "done",
    "front",
    "getValue",
    "iterator",
    "join",
    "length",
    "meminfo",
    "name",
    "next",
    "null",
    "parse",
    "pop_back",
    "pop_front",
    "print",
    "println",
    "push_back",
    "push_front",
    "setValue",
    "split",
    "start",
    "stop",
    "stringify",
    "toFloat",
    "toInt",
    "toString",
    "toUInt",
    "trim",
    "undefined",
    "value",
    "waitForEvent",
];

static SHARED_SORTED: Lazy<()> = Lazy::new(|| {
    debug_assert!(SHARED_ATOM_NAMES.windows(2).all(|w| w[0] < w[1]));
});

/// Two-level atom table: the shared name array, binary-searched, plus a
/// byte pool of concatenated NUL-terminated user atoms. A user atom's id
/// is its byte offset into the pool plus `EXTERNAL_ATOM_OFFSET`.
#[derive(Default)]
pub struct AtomTable {
    pool: Vec<u8>,
}

impl AtomTable {
    pub fn new() -> AtomTable {
        Lazy::force(&SHARED_SORTED);
        AtomTable { pool: Vec::new() }
    }

    pub fn atomize(&mut self, name: &str) -> Atom {
        if name.is_empty() {
            return Atom::NONE;
        }
        if let Ok(i) = SHARED_ATOM_NAMES.binary_search(&name) {
            return Atom(i as u16 + 1);
        }
        if let Some(offset) = self.find_in_pool(name) {
            return Atom(offset + EXTERNAL_ATOM_OFFSET);
        }
        let offset = self.pool.len();
        // The pool indexes with the upper half of the 16-bit id space.
        if offset + name.len() + 1 > (u16::MAX - EXTERNAL_ATOM_OFFSET) as usize {
            return Atom::NONE;
        }
        self.pool.extend_from_slice(name.as_bytes());
        self.pool.push(0);
        Atom(offset as u16 + EXTERNAL_ATOM_OFFSET)
    }

    pub fn string_from(&self, atom: Atom) -> &str {
        if atom.is_none() {
            return "";
        }
        let raw = atom.raw();
        if raw < EXTERNAL_ATOM_OFFSET {
            return SHARED_ATOM_NAMES
                .get(raw as usize - 1)
                .copied()
                .unwrap_or("");
        }
        let start = (raw - EXTERNAL_ATOM_OFFSET) as usize;
        let end = self.pool[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.pool.len());
        std::str::from_utf8(&self.pool[start..end]).unwrap_or("")
    }

    fn find_in_pool(&self, name: &str) -> Option<u16> {
        let bytes = name.as_bytes();
        let mut offset = 0usize;
        while offset < self.pool.len() {
            let end = self.pool[offset..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| offset + p)?;
            if &self.pool[offset..end] == bytes {
                return Some(offset as u16);
            }
            offset = end + 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomize_is_idempotent() {
        let mut table = AtomTable::new();
        let a = table.atomize("counter");
        let b = table.atomize("counter");
        assert_eq!(a, b);
        assert!(a.raw() >= EXTERNAL_ATOM_OFFSET);
        assert_eq!(table.string_from(a), "counter");
    }

    #[test]
    fn shared_atoms_precede_user_atoms() {
        let mut table = AtomTable::new();
        let shared = table.atomize("length");
        assert_eq!(shared, Atom::from(SharedAtom::Length));
        assert!(shared.is_shared());
        assert_eq!(table.string_from(shared), "length");

        let user = table.atomize("lengthy");
        assert!(user.raw() >= EXTERNAL_ATOM_OFFSET);
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let mut table = AtomTable::new();
        let a = table.atomize("alpha");
        let b = table.atomize("beta");
        let c = table.atomize("alpha");
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(table.string_from(b), "beta");
    }

    #[test]
    fn empty_name_is_the_sentinel() {
        let mut table = AtomTable::new();
        assert_eq!(table.atomize(""), Atom::NONE);
        assert_eq!(table.string_from(Atom::NONE), "");
    }
}
