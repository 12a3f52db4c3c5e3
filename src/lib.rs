//! Code interception core for Marble Blast Gold.
//!
//! Built as a `cdylib` with the `attach` feature, this crate is the plugin
//! loader injected into the game: it hooks the engine lifecycle, loads plugin
//! libraries and hands each of them a [`ffi::RawPlugin`] context. Linked as an
//! `rlib`, it is the library plugins are written against: [`Plugin`],
//! [`CodeStream`], [`module::Module`] and the registration macros.

pub mod allocator;
mod code_stream;
pub mod config;
pub mod console;
#[cfg(all(windows, target_arch = "x86"))]
pub mod engine;
mod error;
pub mod ffi;
pub mod host;
pub mod intercept;
pub mod interop;
pub mod loader;
pub mod logger;
pub mod module;
pub mod plugin;
#[cfg(test)]
mod test_support;

pub use code_stream::CodeStream;
pub use error::{Error, Result};
pub use interop::{CallingConvention, HostFn, HostVar, OriginalFn};
pub use module::{Installer, Module};
pub use plugin::Plugin;

#[doc(hidden)]
pub mod __private {
    pub use ctor::ctor;
}

#[cfg(all(feature = "attach", windows, target_arch = "x86"))]
#[ctor::ctor]
fn attach() {
    if let Err(e) = engine::attach() {
        engine::report_attach_failure(e);
    }
}

#[cfg(all(feature = "attach", windows, target_arch = "x86"))]
#[ctor::dtor]
fn detach() {
    engine::detach();
}
