//! Link-time optimization through the `libLTO` plugin.
//!
//! The plugin is a C dynamic library; we load it lazily the first time
//! a bitcode input shows up, cache the handful of entry points we use,
//! and treat the whole thing as a black box that turns bitcode modules
//! into one relocatable Mach-O object. That object is fed back into the
//! linker as a fresh input.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::input::{MappedFile, ObjectFile};

#[cfg(unix)]
mod plugin {
    use super::*;
    use std::ffi::{c_char, c_void, CString};

    type LtoModule = *mut c_void;
    type LtoCodeGen = *mut c_void;

    type ModuleCreateFromMemory =
        unsafe extern "C" fn(mem: *const c_void, length: usize) -> LtoModule;
    type ModuleDispose = unsafe extern "C" fn(module: LtoModule);
    type CodegenCreate = unsafe extern "C" fn() -> LtoCodeGen;
    type CodegenDispose = unsafe extern "C" fn(cg: LtoCodeGen);
    type CodegenAddModule = unsafe extern "C" fn(cg: LtoCodeGen, module: LtoModule) -> bool;
    type CodegenCompile =
        unsafe extern "C" fn(cg: LtoCodeGen, length: *mut usize) -> *const c_void;
    type GetErrorMessage = unsafe extern "C" fn() -> *const c_char;

    pub struct LtoPlugin {
        module_create_from_memory: ModuleCreateFromMemory,
        module_dispose: ModuleDispose,
        codegen_create: CodegenCreate,
        codegen_dispose: CodegenDispose,
        codegen_add_module: CodegenAddModule,
        codegen_compile: CodegenCompile,
        get_error_message: GetErrorMessage,
    }

    impl LtoPlugin {
        pub fn load(path: &str) -> Result<LtoPlugin> {
            let path = if path.is_empty() { "libLTO.dylib" } else { path };
            let cpath = CString::new(path).unwrap();
            // SAFETY: dlopen/dlsym on a user-supplied plugin; the
            // symbol signatures are fixed by the llvm-c/lto.h ABI
            unsafe {
                let handle = libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
                if handle.is_null() {
                    return Err(Error::Malformed(format!(
                        "could not open LTO plugin {}",
                        path
                    )));
                }
                let sym = |name: &str| -> Result<*mut c_void> {
                    let cname = CString::new(name).unwrap();
                    let ptr = libc::dlsym(handle, cname.as_ptr());
                    if ptr.is_null() {
                        Err(Error::Malformed(format!(
                            "{}: missing plugin entry point {}",
                            path, name
                        )))
                    } else {
                        Ok(ptr)
                    }
                };
                Ok(LtoPlugin {
                    module_create_from_memory: std::mem::transmute::<
                        *mut c_void,
                        ModuleCreateFromMemory,
                    >(sym("lto_module_create_from_memory")?),
                    module_dispose: std::mem::transmute::<*mut c_void, ModuleDispose>(sym(
                        "lto_module_dispose",
                    )?),
                    codegen_create: std::mem::transmute::<*mut c_void, CodegenCreate>(sym(
                        "lto_codegen_create",
                    )?),
                    codegen_dispose: std::mem::transmute::<*mut c_void, CodegenDispose>(sym(
                        "lto_codegen_dispose",
                    )?),
                    codegen_add_module: std::mem::transmute::<*mut c_void, CodegenAddModule>(
                        sym("lto_codegen_add_module")?,
                    ),
                    codegen_compile: std::mem::transmute::<*mut c_void, CodegenCompile>(sym(
                        "lto_codegen_compile",
                    )?),
                    get_error_message: std::mem::transmute::<*mut c_void, GetErrorMessage>(sym(
                        "lto_get_error_message",
                    )?),
                })
            }
        }

        fn error(&self) -> String {
            // SAFETY: the plugin returns a NUL-terminated static string
            unsafe {
                let msg = (self.get_error_message)();
                if msg.is_null() {
                    "unknown LTO error".to_string()
                } else {
                    std::ffi::CStr::from_ptr(msg).to_string_lossy().into_owned()
                }
            }
        }

        /// Compiles the given bitcode buffers into one Mach-O object.
        pub fn compile(&self, modules: &[&[u8]]) -> Result<Vec<u8>> {
            // SAFETY: the plugin owns every handle we create here until
            // the matching dispose call
            unsafe {
                let cg = (self.codegen_create)();
                if cg.is_null() {
                    return Err(Error::Malformed(self.error()));
                }
                let mut handles = Vec::new();
                for data in modules {
                    let module =
                        (self.module_create_from_memory)(data.as_ptr() as *const _, data.len());
                    if module.is_null() {
                        (self.codegen_dispose)(cg);
                        return Err(Error::Malformed(self.error()));
                    }
                    if (self.codegen_add_module)(cg, module) {
                        (self.codegen_dispose)(cg);
                        return Err(Error::Malformed(self.error()));
                    }
                    handles.push(module);
                }

                let mut length = 0usize;
                let buf = (self.codegen_compile)(cg, &mut length);
                if buf.is_null() {
                    (self.codegen_dispose)(cg);
                    return Err(Error::Malformed(self.error()));
                }
                let out = std::slice::from_raw_parts(buf as *const u8, length).to_vec();

                for module in handles {
                    (self.module_dispose)(module);
                }
                (self.codegen_dispose)(cg);
                Ok(out)
            }
        }
    }
}

/// Replaces every bitcode input with the single Mach-O object the
/// plugin synthesizes from them.
#[cfg(unix)]
pub fn do_lto<A: Arch>(ctx: &mut Context<A>) -> Result<()> {
    let bitcode: Vec<usize> = (0..ctx.objs.len())
        .filter(|&i| ctx.objs[i].is_lto)
        .collect();
    if bitcode.is_empty() {
        return Ok(());
    }

    let plugin = plugin::LtoPlugin::load(&ctx.arg.lto_library)?;
    let buffers: Vec<&[u8]> = bitcode.iter().map(|&i| ctx.objs[i].data()).collect();
    let compiled = plugin.compile(&buffers)?;
    drop(buffers);

    // the synthesized object takes the first bitcode file's place in
    // the priority order; the originals no longer contribute
    let priority = ctx.objs[bitcode[0]].priority;
    for &i in &bitcode {
        ctx.objs[i]
            .is_alive
            .store(false, std::sync::atomic::Ordering::Relaxed);
        ctx.objs[i].is_lto = false;
        ctx.objs[i].nlists.clear();
        ctx.objs[i].syms.clear();
    }

    let file_idx = ctx.objs.len() as u32;
    let obj = ObjectFile::new(
        MappedFile::from_vec("<lto>".to_string(), compiled),
        String::new(),
        file_idx,
        priority,
        true,
    );
    ctx.objs.push(obj);
    Ok(())
}

#[cfg(not(unix))]
pub fn do_lto<A: Arch>(ctx: &mut Context<A>) -> Result<()> {
    if ctx.objs.iter().any(|obj| obj.is_lto) {
        return Err(Error::Malformed(
            "LTO is not supported on this host".to_string(),
        ));
    }
    Ok(())
}
