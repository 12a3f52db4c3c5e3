//! Function interception for the loader.
//!
//! Plugins call into this through the `intercept` operation. Each plugin
//! host owns one [`FuncInterceptor`], so a plugin's intercepts are undone
//! together when it is unloaded.

mod allocator;
mod interceptor;
mod trampoline;

pub use allocator::{CaveAllocator, CodeAllocator, PageAllocator};
pub use interceptor::{FuncInterceptor, Strategy};
pub use trampoline::{Trampoline, TrampolineGenerator};
