//! Program builder: kernel bundles, constant table, compilation
//!
//! A [`Program`] accumulates a stack of *kernel bundles* (the device-code
//! fragments of the engine — a flux scheme, the friction terms, the dynamic
//! timestep machinery, the boundary kernels) together with an unordered map of
//! named textual constants. `compile()` freezes the constant map, presents it
//! to every bundle in stack order as a typed [`ConstantTable`] (the analogue
//! of a preprocessor-symbol prologue), and collects the named kernel entry
//! points each bundle installs. Kernels are then resolved by name.
//!
//! Constants are mutable only before `compile()`; `register_constant`
//! overwrites, `remove_constant` deletes, `clear_constants` empties. The
//! forced-single-precision switch selects the precision every bundle bakes
//! into its kernels, and the scheme mirrors it when sizing scalar buffers.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::device::{Device, Kernel, KernelBody, KernelEntry};
use crate::Precision;

/// Failures raised while assembling or compiling a program (model-stop).
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("program already compiled; code and constants are frozen")]
    AlreadyCompiled,
    #[error("program not compiled yet")]
    NotCompiled,
    #[error("kernel `{0}` is not defined by any bundle in this program")]
    UnknownKernel(String),
    #[error("kernel `{0}` is defined twice")]
    DuplicateKernel(String),
    #[error("constant `{0}` is required but not registered")]
    MissingConstant(String),
    #[error("constant `{name}` has unparseable expansion `{value}`")]
    BadConstant { name: String, value: String },
    #[error("bundle `{bundle}` failed to build: {message}")]
    Bundle { bundle: String, message: String },
}

// ============================================================================
// Constant table
// ============================================================================

/// Read-only, typed view of the constant map as seen by bundles at compile
/// time. Expansions are textual; the typed getters parse on demand.
pub struct ConstantTable<'a> {
    map: &'a HashMap<String, String>,
    forced_single: bool,
}

impl ConstantTable<'_> {
    /// Is the named constant defined at all?
    pub fn defined(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str, CompileError> {
        self.get(name)
            .ok_or_else(|| CompileError::MissingConstant(name.to_string()))
    }

    pub fn require_f64(&self, name: &str) -> Result<f64, CompileError> {
        let raw = self.require(name)?;
        raw.parse::<f64>().map_err(|_| CompileError::BadConstant {
            name: name.to_string(),
            value: raw.to_string(),
        })
    }

    pub fn require_usize(&self, name: &str) -> Result<usize, CompileError> {
        let raw = self.require(name)?;
        raw.parse::<usize>().map_err(|_| CompileError::BadConstant {
            name: name.to_string(),
            value: raw.to_string(),
        })
    }

    /// Parse the constant if present, `default` otherwise.
    pub fn f64_or(&self, name: &str, default: f64) -> Result<f64, CompileError> {
        match self.get(name) {
            None => Ok(default),
            Some(_) => self.require_f64(name),
        }
    }

    /// Precision macro selected for this compilation.
    pub fn precision(&self) -> Precision {
        if self.forced_single {
            Precision::Single
        } else {
            Precision::Double
        }
    }
}

// ============================================================================
// Bundles and the kernel set
// ============================================================================

/// One fragment of device code: given the constant table, installs its named
/// kernels into the program's kernel set.
pub trait KernelBundle: Send {
    /// Stable label used in diagnostics.
    fn label(&self) -> &'static str;

    fn install(&self, constants: &ConstantTable<'_>, out: &mut KernelSet)
        -> Result<(), CompileError>;
}

/// The compiled registry of kernel entry points, keyed by name.
#[derive(Default)]
pub struct KernelSet {
    entries: HashMap<String, Arc<KernelEntry>>,
}

impl KernelSet {
    /// Install a kernel entry; duplicate names are a compile error.
    pub fn add(&mut self, name: &str, arity: usize, body: KernelBody) -> Result<(), CompileError> {
        if self.entries.contains_key(name) {
            return Err(CompileError::DuplicateKernel(name.to_string()));
        }
        self.entries.insert(
            name.to_string(),
            Arc::new(KernelEntry {
                name: name.to_string(),
                arity,
                body,
            }),
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Program
// ============================================================================

/// A device program under construction, then compiled.
pub struct Program {
    device: Device,
    code: Vec<Box<dyn KernelBundle>>,
    constants: HashMap<String, String>,
    forced_single: bool,
    compiled: Option<KernelSet>,
}

impl Program {
    pub fn new(device: &Device) -> Program {
        Program {
            device: device.clone(),
            code: Vec::new(),
            constants: HashMap::new(),
            forced_single: false,
            compiled: None,
        }
    }

    /// Append a bundle after everything already stacked.
    pub fn append_code(&mut self, bundle: Box<dyn KernelBundle>) {
        self.code.push(bundle);
    }

    /// Prepend a bundle before everything already stacked.
    pub fn prepend_code(&mut self, bundle: Box<dyn KernelBundle>) {
        self.code.insert(0, bundle);
    }

    /// Drop all stacked bundles (constants are kept).
    pub fn clear_code(&mut self) {
        self.code.clear();
    }

    /// Register (or overwrite) a constant. Returns `false` once compiled.
    pub fn register_constant(&mut self, name: &str, value: impl Into<String>) -> bool {
        if self.compiled.is_some() {
            return false;
        }
        self.constants.insert(name.to_string(), value.into());
        true
    }

    /// Remove a constant. Returns `false` if absent or already compiled.
    pub fn remove_constant(&mut self, name: &str) -> bool {
        if self.compiled.is_some() {
            return false;
        }
        self.constants.remove(name).is_some()
    }

    /// Drop every registered constant (before compilation only).
    pub fn clear_constants(&mut self) {
        if self.compiled.is_none() {
            self.constants.clear();
        }
    }

    /// Force 32-bit scalar storage for this program's kernels and buffers.
    pub fn set_forced_single_precision(&mut self, forced: bool) {
        if self.compiled.is_none() {
            self.forced_single = forced;
        }
    }

    pub fn precision(&self) -> Precision {
        if self.forced_single {
            Precision::Single
        } else {
            Precision::Double
        }
    }

    /// Bytes per scalar under the selected precision.
    pub fn scalar_size(&self) -> usize {
        self.precision().scalar_size()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Freeze constants and run every stacked bundle in order.
    pub fn compile(&mut self) -> Result<(), CompileError> {
        if self.compiled.is_some() {
            return Err(CompileError::AlreadyCompiled);
        }
        let table = ConstantTable {
            map: &self.constants,
            forced_single: self.forced_single,
        };
        let mut set = KernelSet::default();
        for bundle in &self.code {
            debug!(bundle = bundle.label(), "building kernel bundle");
            bundle.install(&table, &mut set)?;
        }
        info!(
            kernels = set.len(),
            constants = self.constants.len(),
            precision = ?self.precision(),
            "program compiled"
        );
        self.compiled = Some(set);
        Ok(())
    }

    /// Resolve a named kernel from the compiled registry.
    pub fn get_kernel(&self, name: &str) -> Result<Kernel, CompileError> {
        let set = self.compiled.as_ref().ok_or(CompileError::NotCompiled)?;
        let entry = set
            .entries
            .get(name)
            .ok_or_else(|| CompileError::UnknownKernel(name.to_string()))?;
        Ok(Kernel::from_entry(self.device.clone(), Arc::clone(entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceFilter, Executor};

    struct OneKernel;

    impl KernelBundle for OneKernel {
        fn label(&self) -> &'static str {
            "one-kernel"
        }

        fn install(
            &self,
            constants: &ConstantTable<'_>,
            out: &mut KernelSet,
        ) -> Result<(), CompileError> {
            let _threshold = constants.require_f64("VERY_SMALL")?;
            out.add("noop", 0, Box::new(|_| Ok(())))
        }
    }

    fn device() -> crate::device::Device {
        Executor::new().select_device(&DeviceFilter::default()).unwrap()
    }

    #[test]
    fn compile_installs_kernels_and_freezes_constants() {
        let dev = device();
        let mut program = Program::new(&dev);
        program.append_code(Box::new(OneKernel));
        assert!(program.register_constant("VERY_SMALL", "1e-10"));
        program.compile().unwrap();
        assert!(program.is_compiled());
        assert!(program.get_kernel("noop").is_ok());
        assert!(matches!(
            program.get_kernel("missing"),
            Err(CompileError::UnknownKernel(_))
        ));
        // Frozen after compile.
        assert!(!program.register_constant("VERY_SMALL", "2e-10"));
        assert!(!program.remove_constant("VERY_SMALL"));
        assert!(matches!(program.compile(), Err(CompileError::AlreadyCompiled)));
    }

    #[test]
    fn missing_constant_fails_compilation() {
        let dev = device();
        let mut program = Program::new(&dev);
        program.append_code(Box::new(OneKernel));
        assert!(matches!(
            program.compile(),
            Err(CompileError::MissingConstant(_))
        ));
    }

    #[test]
    fn bad_constant_expansion_fails_compilation() {
        let dev = device();
        let mut program = Program::new(&dev);
        program.append_code(Box::new(OneKernel));
        program.register_constant("VERY_SMALL", "not-a-number");
        assert!(matches!(
            program.compile(),
            Err(CompileError::BadConstant { .. })
        ));
    }

    #[test]
    fn constants_overwrite_and_remove_before_compile() {
        let dev = device();
        let mut program = Program::new(&dev);
        program.register_constant("K", "1");
        program.register_constant("K", "2");
        assert!(program.remove_constant("K"));
        assert!(!program.remove_constant("K"));
        program.register_constant("K", "3");
        program.clear_constants();
        assert!(!program.remove_constant("K"));
    }

    #[test]
    fn forced_single_precision_propagates() {
        let dev = device();
        let mut program = Program::new(&dev);
        assert_eq!(program.precision(), Precision::Double);
        assert_eq!(program.scalar_size(), 8);
        program.set_forced_single_precision(true);
        assert_eq!(program.precision(), Precision::Single);
        assert_eq!(program.scalar_size(), 4);
    }
}
