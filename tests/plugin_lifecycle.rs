//! A plugin going through the loader from `PluginMain` to unload.

use std::env::consts::DLL_EXTENSION;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use mbextender::ffi::{CpuFeatures, RawPlugin, Status};
use mbextender::intercept::{CaveAllocator, CodeAllocator};
use mbextender::loader::{LoaderOptions, PluginLoader};
use mbextender::plugin::run_plugin_main;
use mbextender::{CodeStream, Error, Plugin};

const CODE_SIZE: usize = 0x400;
const CAVE_SIZE: usize = 0x800;
const CHUNK: usize = 0x200;

/// Loader over a fake code segment. The loader goes first so that its
/// plugins restore their intercepts while the buffer still exists.
struct Game {
    loader: PluginLoader,
    start: *mut u8,
    _buffer: Vec<u8>,
}

impl Game {
    fn new() -> Self {
        let mut buffer = vec![0xCC_u8; CODE_SIZE + CAVE_SIZE];
        let start = buffer.as_mut_ptr();
        let options = LoaderOptions {
            text_start: start,
            text_size: CODE_SIZE,
            bitness: 64,
            cpu_features: CpuFeatures::empty(),
            build_pipeline: 0,
            build_hash: String::new(),
        };
        let cave = start as usize + CODE_SIZE;
        let mut used = 0;
        let loader = PluginLoader::new(
            options,
            Box::new(move || {
                let size = CHUNK.min(CAVE_SIZE - used);
                let chunk = (cave + used) as *mut u8;
                used += size;
                Box::new(unsafe { CaveAllocator::new(chunk, size) }) as Box<dyn CodeAllocator + Send>
            }),
        );
        Game {
            loader,
            start,
            _buffer: buffer,
        }
    }

    fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.start.add(offset) }
    }

    fn jump_target(&self, offset: usize) -> Option<*mut u8> {
        unsafe { CodeStream::new(self.at(offset), 5) }.peek_rel32_jump()
    }
}

fn library(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, DLL_EXTENSION))
}

static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());
static HOOK_TARGET: AtomicUsize = AtomicUsize::new(0);
static HOOK_REPLACEMENT: AtomicUsize = AtomicUsize::new(0);

fn record(event: impl Into<String>) {
    EVENTS.lock().unwrap().push(event.into());
}

extern "C" fn on_start() {
    record("start");
}

extern "C" fn on_tick(delta_ms: u32) {
    record(format!("tick {}", delta_ms));
}

extern "C" fn on_exit() {
    record("exit");
}

extern "C" fn on_unload() {
    record("unload");
}

extern "C" fn on_broken_start() {
    record("broken start");
}

fn init_physics(plugin: &mut Plugin) -> mbextender::Result<()> {
    plugin.on_game_start(on_start);
    plugin.on_client_process(on_tick);
    plugin.on_game_exit(on_exit);
    plugin.on_unload(on_unload);

    let target = HOOK_TARGET.load(Ordering::SeqCst) as *mut _;
    let replacement = HOOK_REPLACEMENT.load(Ordering::SeqCst) as *mut _;
    plugin.intercept_raw(target, replacement)?;
    Ok(())
}

unsafe extern "C" fn physics_main(raw: *const RawPlugin) -> Status {
    run_plugin_main(raw, init_physics)
}

fn init_broken(plugin: &mut Plugin) -> mbextender::Result<()> {
    plugin.on_game_start(on_broken_start);
    Err(Error::MissingDirectory(PathBuf::from("marbles")))
}

unsafe extern "C" fn broken_main(raw: *const RawPlugin) -> Status {
    run_plugin_main(raw, init_broken)
}

#[test]
fn plugin_lifecycle_from_load_to_unload() {
    let dir = tempfile::tempdir().unwrap();
    let mut game = Game::new();

    // A function that is already a jump thunk to 0x100
    let mut stream = unsafe { CodeStream::new(game.start, CODE_SIZE) };
    assert!(stream.write_rel32_jump(game.at(0x100)));
    HOOK_TARGET.store(game.at(0) as usize, Ordering::SeqCst);
    HOOK_REPLACEMENT.store(game.at(0x200) as usize, Ordering::SeqCst);

    game.loader
        .load_entry("Physics", &library(dir.path(), "Physics"), physics_main, None)
        .unwrap();
    let err = game
        .loader
        .load_entry("Broken", &library(dir.path(), "Broken"), broken_main, None)
        .unwrap_err();
    assert_eq!(err.to_string(), "Broken: marbles is missing");
    assert_eq!(game.loader.plugin_names().collect::<Vec<_>>(), ["Physics"]);
    assert_eq!(game.jump_target(0), Some(game.at(0x200)));

    game.loader.fire_game_start();
    game.loader.fire_client_process(16);
    game.loader.fire_client_process(17);
    game.loader.fire_game_exit();
    game.loader.unload_all();

    assert_eq!(
        *EVENTS.lock().unwrap(),
        ["start", "tick 16", "tick 17", "exit", "unload"]
    );
    assert!(game.loader.is_empty());
    assert_eq!(game.jump_target(0), Some(game.at(0x100)));
    assert!(library(dir.path(), "Physics").with_extension(format!("{}.log", DLL_EXTENSION)).exists());
}
