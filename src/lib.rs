//! Load relocatable ELF objects into the running process and call into them.
//!
//! [`LoadedObject::open`] reads an unlinked object file, maps its allocatable
//! sections into an executable arena, applies relocations against both the
//! object's own sections and symbols exported by the host process, and hands
//! back a handle whose [`LoadedObject::sym`] resolves defined function and
//! data symbols to runtime addresses. Dropping the handle unmaps everything.

pub mod arch;
mod arena;
mod index;
mod loader;

use std::ops::Range;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::arena::Arena;
use crate::index::SymbolIndex;
pub use crate::loader::{DlResolver, HostResolver, ObjectLoader, SectionPerm};

pub type Result<T> = core::result::Result<T, ObjErr>;

#[derive(Debug)]
pub enum ObjErr {
    /// The input file could not be read.
    Io { path: String, source: std::io::Error },
    /// The input is not a relocatable ELF image for this host.
    NotElf(String),
    /// A relocation referenced a symbol of a kind the loader does not handle.
    UnsupportedSymKind(u8),
    /// An undefined symbol was not known to the host resolver.
    UnresolvedSymbol(String),
    /// A relocation type outside the supported set for this machine.
    UnknownReloc(u32),
    /// The object carries relocations for a machine this loader does not handle.
    UnsupportedMachine(u16),
    /// The executable mapping could not be created.
    MmapFailed(std::io::Error),
    /// The image is structurally inconsistent.
    BadObject(String),
}

impl core::fmt::Display for ObjErr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ObjErr::Io { path, source } => write!(f, "failed to open {}: {}", path, source),
            ObjErr::NotElf(path) => write!(f, "{} is not ELF", path),
            ObjErr::UnsupportedSymKind(kind) => write!(f, "unsupported relocation sym {}", kind),
            ObjErr::UnresolvedSymbol(name) => write!(f, "failed to resolve {}", name),
            ObjErr::UnknownReloc(n) => write!(f, "Unknown reloc: {}", n),
            ObjErr::UnsupportedMachine(machine) => {
                write!(f, "relocations for machine {:#x} not supported", machine)
            }
            ObjErr::MmapFailed(source) => write!(f, "mmap failed: {}", source),
            ObjErr::BadObject(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ObjErr {}

/// The most recent message is kept in a process-wide slot, bounded to 256
/// bytes, for callers that want dlerror-style reporting on top of the
/// structured [`ObjErr`] values.
const ERROR_SLOT_CAP: usize = 256;

static LAST_ERROR: Mutex<String> = Mutex::new(String::new());

fn record_error(err: &ObjErr) {
    let mut msg = err.to_string();
    if msg.len() > ERROR_SLOT_CAP {
        let mut end = ERROR_SLOT_CAP;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg.truncate(end);
    }
    *LAST_ERROR.lock().unwrap_or_else(PoisonError::into_inner) = msg;
}

/// Message of the most recent failed open, or an empty string if nothing
/// has failed yet. Overwritten by every failure; don't expect stability
/// across calls.
pub fn last_error() -> String {
    LAST_ERROR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

bitflags::bitflags! {
    /// Flags accepted by [`LoadedObject::open_with`]. Reserved; no bits are
    /// currently interpreted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {}
}

/// A relocated object image plus the index of its defined symbols.
///
/// The handle exclusively owns its mapping; dropping it invalidates every
/// address previously returned by [`LoadedObject::sym`].
#[derive(Debug)]
pub struct LoadedObject {
    pub(crate) arena: Arena,
    pub(crate) index: SymbolIndex,
}

// The mapping is never written after open returns and the index is
// immutable, so lookups may run from any thread.
unsafe impl Send for LoadedObject {}
unsafe impl Sync for LoadedObject {}

impl LoadedObject {
    /// Open `path` with the process's dynamic loader as the host resolver.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with::<DlResolver, P>(path, OpenFlags::empty())
    }

    /// Open `path`, resolving undefined symbols through `R`. `flags` is
    /// reserved for future use.
    pub fn open_with<R: HostResolver, P: AsRef<Path>>(path: P, _flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref();
        let result = Self::load::<R>(path);
        if let Err(err) = &result {
            log::warn!("{}: {}", path.display(), err);
            record_error(err);
        }
        result
    }

    fn load<R: HostResolver>(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        let bin = std::fs::read(path).map_err(|source| ObjErr::Io {
            path: name.clone(),
            source,
        })?;
        let obj = ObjectLoader::<R>::new(&bin, &name)?.load()?;
        #[cfg(feature = "load-log")]
        {
            let range = obj.image_range();
            append_load_log(format_args!(
                "objopen {:#x}-{:#x} {}",
                range.start, range.end, name
            ));
        }
        // The file buffer is dropped here; the handle owns only the arena
        // and its name copies.
        Ok(obj)
    }

    /// Runtime address of the named symbol, or `None`. Byte-exact
    /// comparison; on duplicate names the first record wins.
    pub fn sym(&self, name: &str) -> Option<*mut u8> {
        self.index.get(name)
    }

    /// Every defined function and data symbol, in symbol table order.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, *mut u8)> {
        self.index.iter()
    }

    /// Address range of the mapped image.
    pub fn image_range(&self) -> Range<usize> {
        self.arena.range()
    }
}

impl Drop for LoadedObject {
    fn drop(&mut self) {
        let range = self.arena.range();
        log::debug!("closing image at {:#x}-{:#x}", range.start, range.end);
        #[cfg(feature = "load-log")]
        append_load_log(format_args!("objclose {:#x}-{:#x}", range.start, range.end));
    }
}

#[cfg(feature = "load-log")]
fn append_load_log(line: core::fmt::Arguments<'_>) {
    use std::io::Write;

    let path = std::env::temp_dir().join(format!("objload.{}.log", std::process::id()));
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        let _ = writeln!(file, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_slot_keeps_most_recent_message_bounded() {
        record_error(&ObjErr::UnresolvedSymbol("first".into()));
        assert_eq!(last_error(), "failed to resolve first");

        record_error(&ObjErr::UnknownReloc(99));
        assert_eq!(last_error(), "Unknown reloc: 99");

        let long_name = "x".repeat(2 * ERROR_SLOT_CAP);
        record_error(&ObjErr::UnresolvedSymbol(long_name));
        assert_eq!(last_error().len(), ERROR_SLOT_CAP);
    }

    #[test]
    fn display_matches_reported_forms() {
        assert_eq!(
            ObjErr::NotElf("a.out".into()).to_string(),
            "a.out is not ELF"
        );
        assert_eq!(
            ObjErr::UnsupportedSymKind(4).to_string(),
            "unsupported relocation sym 4"
        );
        assert_eq!(ObjErr::UnknownReloc(7).to_string(), "Unknown reloc: 7");
    }
}
