//! Stand-in for the game process: a code buffer plus a loader-side host
//! record pointing at it.

use std::env::consts::DLL_EXTENSION;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::console::NullConsole;
use crate::ffi::{CpuFeatures, RawPlugin};
use crate::intercept::{CaveAllocator, CodeAllocator};
use crate::loader::{LoaderOptions, PluginHost, PluginLoader};
use crate::plugin::Plugin;

/// Bytes of fake `.text`.
pub(crate) const CODE_SIZE: usize = 0x1000;
/// Trampoline arena after the code, handed out in chunks.
const CAVE_SIZE: usize = 0x4000;
const CAVE_CHUNK: usize = 0x400;

pub(crate) struct FakeHost {
    // Field order matters: the host still points into the buffer when dropped
    pub(crate) host: Box<PluginHost>,
    options: LoaderOptions,
    path: PathBuf,
    buffer: Vec<u8>,
    _dir: TempDir,
}

impl FakeHost {
    pub(crate) fn new(bitness: u32) -> Self {
        Self::named(bitness, "Test")
    }

    pub(crate) fn named(bitness: u32, name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{}.{}", name, DLL_EXTENSION));
        let mut buffer = vec![0xCC; CODE_SIZE + CAVE_SIZE];
        let options = LoaderOptions {
            text_start: buffer.as_mut_ptr(),
            text_size: CODE_SIZE,
            bitness,
            cpu_features: CpuFeatures::SSE,
            build_pipeline: 0,
            build_hash: String::new(),
        };
        let cave = unsafe { CaveAllocator::new(buffer.as_mut_ptr().add(CODE_SIZE), CAVE_CHUNK) };
        let host = PluginHost::new(name, &path, &options, Box::new(cave));
        FakeHost {
            host,
            options,
            path,
            buffer,
            _dir: dir,
        }
    }

    pub(crate) fn code_start(&self) -> *mut u8 {
        self.options.text_start
    }

    pub(crate) fn code(&self) -> &[u8] {
        &self.buffer[..CODE_SIZE]
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn set_versions(&mut self, version: u32, min_version: u32) {
        let raw: &mut RawPlugin = self.host.raw_mut();
        raw.version = version;
        raw.min_version = min_version;
    }

    /// Plugin-side view of the host record, with console registration
    /// switched off.
    pub(crate) fn plugin(&self) -> Plugin {
        let mut plugin = unsafe { Plugin::new(self.host.raw()) };
        plugin.set_console(Box::new(NullConsole));
        plugin
    }

    /// Loader over the same buffer. Every plugin it loads gets its own slice
    /// of the trampoline arena. Must be dropped before `self`.
    pub(crate) fn loader(&self) -> PluginLoader {
        let base = self.options.text_start as usize + CODE_SIZE;
        let mut next = CAVE_CHUNK;
        PluginLoader::new(
            self.options.clone(),
            Box::new(move || {
                let size = CAVE_CHUNK.min(CAVE_SIZE.saturating_sub(next));
                let start = (base + next) as *mut u8;
                next += size;
                Box::new(unsafe { CaveAllocator::new(start, size) }) as Box<dyn CodeAllocator + Send>
            }),
        )
    }
}
