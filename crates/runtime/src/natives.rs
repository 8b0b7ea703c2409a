//! Built-in native functions.
//!
//! The narrow host hook: a native is a plain function pointer with a fixed
//! arity, registered as a global before any guest code runs. The default
//! set only exposes the host clock.

use std::time::{SystemTime, UNIX_EPOCH};

use fidel_core::{Heap, Value};

use crate::vm::Vm;

/// Seconds since the Unix epoch, as a number. Registered as `ሰዓት`.
pub fn clock_native(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("clock unavailable: {e}"))?;
    Ok(Value::Number(now.as_secs_f64()))
}

pub fn register_default_natives(vm: &mut Vm) {
    vm.register_native("ሰዓት", 0, clock_native);
}
