//! Embedded interpreter bridge (spec.md §3 `Model`, §4.5 "model dispatch").
//! Resolves `backend.i2c`, `backend.gpio`, `backend.platform` and the
//! optional `backend.process_control` out of the main script once at
//! startup, then dispatches one call per `ScriptJob` — always from the
//! script thread, never concurrently, which is the invariant
//! SPEC_FULL.md's REDESIGN FLAGS section exists to preserve.

use std::path::Path;

use pyo3::prelude::*;
use pyo3::types::PyModule;

use crate::error::{FatalError, ScriptError};
use crate::script::host_api::HostApi;
use crate::script::job::ModelSurface;

/// One loaded model surface: the Python object chip-model callables are
/// dispatched against.
struct Surface {
    object: Py<PyAny>,
}

pub struct ScriptEngine {
    i2c: Surface,
    gpio: Surface,
    platform: Surface,
    process_control: Option<Py<PyAny>>,
    host: HostApi,
    module_counter: u64,
}

fn pyerr_to_script(py: Python<'_>, err: &PyErr) -> ScriptError {
    let traceback = err
        .traceback(py)
        .and_then(|tb| tb.format().ok())
        .unwrap_or_default();
    ScriptError::new(format!("{err}\n{traceback}"))
}

impl ScriptEngine {
    /// Load the main script and resolve its three device surfaces. Any
    /// failure here — a syntax error, a missing `backend.{i2c,gpio,platform}`
    /// attribute — is fatal: the backend serves no socket until the model is
    /// loaded (SPEC_FULL.md §7 error mapping table).
    pub fn load(main_script: &Path, host: HostApi) -> Result<Self, FatalError> {
        let code = std::fs::read_to_string(main_script).map_err(FatalError::Spawn)?;
        Python::with_gil(|py| {
            let module = PyModule::from_code(py, &code, &main_script.to_string_lossy(), "roadtest_main")
                .map_err(|e| FatalError::ScriptLoad {
                    path: main_script.display().to_string(),
                    source: pyerr_to_script(py, &e),
                })?;

            let host_obj = Py::new(py, host.clone()).map_err(|e| FatalError::ScriptLoad {
                path: main_script.display().to_string(),
                source: pyerr_to_script(py, &e),
            })?;
            module
                .setattr("host", host_obj)
                .map_err(|e| FatalError::ScriptLoad {
                    path: main_script.display().to_string(),
                    source: pyerr_to_script(py, &e),
                })?;

            let backend = module.getattr("backend").map_err(|_| FatalError::MissingSurface("backend"))?;

            let resolve = |name: &'static str, methods: &'static [&'static str]| -> Result<Surface, FatalError> {
                let obj = backend
                    .getattr(name)
                    .map_err(|_| FatalError::MissingSurface(name))?;
                for method in methods {
                    if !obj.hasattr(*method).unwrap_or(false) {
                        return Err(FatalError::MissingCallable { surface: name, method });
                    }
                }
                Ok(Surface { object: obj.unbind() })
            };

            // Required callables per SPEC_FULL.md §4.5's surface table, resolved
            // once at startup so a script missing one fails fast rather than on
            // the first request that happens to need it.
            let i2c = resolve("i2c", &["read", "write"])?;
            let gpio = resolve("gpio", &["set_irq_type", "set_value", "unmask"])?;
            let platform = resolve("platform", &["read", "write"])?;
            let process_control = backend.getattr("process_control").ok().map(|a| a.unbind());

            Ok(Self {
                i2c,
                gpio,
                platform,
                process_control,
                host,
                module_counter: 0,
            })
        })
    }

    fn surface(&self, which: ModelSurface) -> &Surface {
        match which {
            ModelSurface::I2c => &self.i2c,
            ModelSurface::Gpio => &self.gpio,
            ModelSurface::Platform => &self.platform,
        }
    }

    fn surface_mut(&mut self, which: ModelSurface) -> &mut Surface {
        match which {
            ModelSurface::I2c => &mut self.i2c,
            ModelSurface::Gpio => &mut self.gpio,
            ModelSurface::Platform => &mut self.platform,
        }
    }

    pub fn i2c_read(&self, addr: u16, len: usize) -> Result<Vec<u8>, ScriptError> {
        Python::with_gil(|py| {
            let result = self
                .i2c
                .object
                .bind(py)
                .call_method1("read", (addr, len))
                .map_err(|e| pyerr_to_script(py, &e))?;
            result
                .extract::<Vec<u8>>()
                .map_err(|e| ScriptError::new(e.to_string()))
        })
    }

    pub fn i2c_write(&self, addr: u16, data: &[u8]) -> Result<(), ScriptError> {
        Python::with_gil(|py| {
            self.i2c
                .object
                .bind(py)
                .call_method1("write", (addr, data.to_vec()))
                .map(|_| ())
                .map_err(|e| pyerr_to_script(py, &e))
        })
    }

    pub fn gpio_set_value(&self, pin: u32, value: bool) -> Result<(), ScriptError> {
        Python::with_gil(|py| {
            self.gpio
                .object
                .bind(py)
                .call_method1("set_value", (pin, value))
                .map(|_| ())
                .map_err(|e| pyerr_to_script(py, &e))
        })
    }

    pub fn gpio_set_irq_type(&self, pin: u32, irq_type: u32) -> Result<(), ScriptError> {
        Python::with_gil(|py| {
            self.gpio
                .object
                .bind(py)
                .call_method1("set_irq_type", (pin, irq_type))
                .map(|_| ())
                .map_err(|e| pyerr_to_script(py, &e))
        })
    }

    pub fn gpio_unmask(&self, pin: u32) -> Result<(), ScriptError> {
        Python::with_gil(|py| {
            self.gpio
                .object
                .bind(py)
                .call_method1("unmask", (pin,))
                .map(|_| ())
                .map_err(|e| pyerr_to_script(py, &e))
        })
    }

    pub fn platform_read(&self, offset: u64, len: u8) -> Result<u64, ScriptError> {
        Python::with_gil(|py| {
            let result = self
                .platform
                .object
                .bind(py)
                .call_method1("read", (offset, len))
                .map_err(|e| pyerr_to_script(py, &e))?;
            result.extract::<u64>().map_err(|e| ScriptError::new(e.to_string()))
        })
    }

    pub fn platform_write(&self, offset: u64, len: u8, value: u64) -> Result<(), ScriptError> {
        Python::with_gil(|py| {
            self.platform
                .object
                .bind(py)
                .call_method1("write", (offset, len, value))
                .map(|_| ())
                .map_err(|e| pyerr_to_script(py, &e))
        })
    }

    /// Hand a raw control-channel line to `backend.process_control`, if the
    /// script defines one. Scripts that don't care about the control channel
    /// simply omit the attribute (SPEC_FULL.md §4.9).
    pub fn process_control(&self, line: &str) -> Result<(), ScriptError> {
        let Some(callable) = &self.process_control else {
            return Ok(());
        };
        Python::with_gil(|py| {
            callable
                .bind(py)
                .call1((line,))
                .map(|_| ())
                .map_err(|e| pyerr_to_script(py, &e))
        })
    }

    /// Call an arbitrary method on a loaded surface, passing the
    /// control-channel's JSON argument blob through as a single string — the
    /// model is responsible for parsing it, keeping this bridge free of an
    /// extra JSON-to-Python marshalling dependency.
    pub fn call(&self, surface: ModelSurface, method: &str, args_json: &str) -> Result<(), ScriptError> {
        Python::with_gil(|py| {
            self.surface(surface)
                .object
                .bind(py)
                .call_method1(method, (args_json,))
                .map(|_| ())
                .map_err(|e| pyerr_to_script(py, &e))
        })
    }

    /// Reload one surface from a fresh module file (control channel `load`
    /// line). The replacement module is given a distinct synthetic name so
    /// repeated reloads of the same path don't collide in `sys.modules`.
    pub fn reload(&mut self, surface: ModelSurface, path: &str) -> Result<(), ScriptError> {
        self.module_counter += 1;
        let name = format!("roadtest_reload_{}", self.module_counter);
        let code = std::fs::read_to_string(path).map_err(|e| ScriptError::new(e.to_string()))?;
        let host = self.host.clone();

        let object = Python::with_gil(|py| -> Result<Py<PyAny>, ScriptError> {
            let module = PyModule::from_code(py, &code, path, &name).map_err(|e| pyerr_to_script(py, &e))?;
            let host_obj = Py::new(py, host).map_err(|e| pyerr_to_script(py, &e))?;
            module
                .setattr("host", host_obj)
                .map_err(|e| pyerr_to_script(py, &e))?;
            let model = module.getattr("model").map_err(|e| pyerr_to_script(py, &e))?;
            Ok(model.unbind())
        })?;

        self.surface_mut(surface).object = object;
        Ok(())
    }
}
