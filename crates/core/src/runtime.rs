//! Locating the native pieces the pipeline shells out to or links at runtime:
//! `ffmpeg`/`ffprobe` binaries and the ONNX Runtime / CUDA shared libraries.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Directories probed for bundled runtime files, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPaths {
    pub lib_dirs: Vec<PathBuf>,
    pub bin_dirs: Vec<PathBuf>,
}

impl SearchPaths {
    /// `lib/` and `bin/` next to the executable, one level up, and under the
    /// working directory. Unix adds the usual system library directories.
    pub fn discover() -> Self {
        let exe_dir = env::current_exe()
            .and_then(|p| p.canonicalize())
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let cwd = env::current_dir().ok();
        Self::from_roots(exe_dir.as_deref(), cwd.as_deref())
    }

    fn from_roots(exe_dir: Option<&Path>, cwd: Option<&Path>) -> Self {
        let mut lib_dirs = Vec::new();
        let mut bin_dirs = Vec::new();

        if let Some(exe_dir) = exe_dir {
            #[cfg(windows)]
            push_unique(&mut lib_dirs, exe_dir.to_path_buf());
            push_unique(&mut lib_dirs, exe_dir.join("lib"));
            push_unique(&mut bin_dirs, exe_dir.to_path_buf());
            push_unique(&mut bin_dirs, exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                push_unique(&mut lib_dirs, parent.join("lib"));
                push_unique(&mut bin_dirs, parent.join("bin"));
            }
        }

        if let Some(cwd) = cwd {
            push_unique(&mut lib_dirs, cwd.join("lib"));
            push_unique(&mut bin_dirs, cwd.to_path_buf());
            push_unique(&mut bin_dirs, cwd.join("bin"));
        }

        #[cfg(unix)]
        {
            lib_dirs.push(PathBuf::from("/usr/local/lib"));
            lib_dirs.push(PathBuf::from("/usr/lib"));
        }

        Self { lib_dirs, bin_dirs }
    }

    pub fn find_binary(&self, binary: &str) -> Option<PathBuf> {
        let names = binary_names(binary);
        self.bin_dirs
            .iter()
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
    }

    pub fn find_ort_dylib(&self) -> Option<PathBuf> {
        self.lib_dirs
            .iter()
            .map(|dir| dir.join(ORT_LIB_NAME))
            .find(|candidate| candidate.is_file())
    }
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

#[cfg(unix)]
fn binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn binary_names(binary: &str) -> Vec<String> {
    if binary.to_ascii_lowercase().ends_with(".exe") {
        vec![binary.to_string()]
    } else {
        vec![format!("{binary}.exe"), binary.to_string()]
    }
}

/// A `Command` for `binary`, preferring a bundled copy over `PATH` lookup.
pub fn command_for(binary: &str) -> Command {
    match SearchPaths::discover().find_binary(binary) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// Load order for GPU runtime libraries: each tier depends on the previous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GpuLibTier {
    CudaRuntime,
    Cudnn,
    TensorRt,
}

/// ORT provider libraries are left out; they need symbols from
/// `libonnxruntime` which `ort` loads itself.
fn gpu_lib_tier(file_name: &str) -> Option<GpuLibTier> {
    let name = file_name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    const CUDA_RUNTIME: [&str; 5] = ["cudart", "cublas", "cublaslt", "cufft", "curand"];

    if CUDA_RUNTIME.iter().any(|prefix| name.starts_with(prefix)) {
        Some(GpuLibTier::CudaRuntime)
    } else if name.starts_with("cudnn") {
        Some(GpuLibTier::Cudnn)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(GpuLibTier::TensorRt)
    } else {
        None
    }
}

fn is_shared_library(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if cfg!(windows) {
        name.ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// GPU libraries found in `dirs`, ordered by tier then name. The first
/// directory holding a given file name wins.
fn collect_gpu_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if !is_shared_library(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(tier) = gpu_lib_tier(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                libs.push((tier, name, path));
            }
        }
    }

    libs.sort();
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
fn load_global(path: &Path) -> bool {
    // SAFETY: the libraries are plain CUDA/TensorRT runtimes whose
    // initializers have no preconditions on our side.
    let lib = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    match lib {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn load_global(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    /// `ORT_DYLIB_PATH` value in effect, whether detected or inherited.
    pub ort_dylib: Option<PathBuf>,
    pub ort_dylib_detected: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Points `ort` at a bundled ONNX Runtime and preloads GPU libraries with
/// global symbol visibility.
///
/// Must run before the first `ort` call. The dynamic loader caches
/// `LD_LIBRARY_PATH` at startup, so libraries are loaded by absolute path.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let paths = SearchPaths::discover();
    let mut report = RuntimeLibReport::default();

    match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => report.ort_dylib = Some(PathBuf::from(existing)),
        None => {
            if let Some(path) = paths.find_ort_dylib() {
                env::set_var(ORT_DYLIB_ENV, &path);
                report.ort_dylib = Some(path);
                report.ort_dylib_detected = true;
            }
        }
    }

    report.preloaded = collect_gpu_libs(&paths.lib_dirs)
        .into_iter()
        .filter(|path| load_global(path))
        .collect();

    report
}

/// Call once tracing is initialized.
pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            auto_detected = report.ort_dylib_detected,
            "ONNX Runtime library"
        ),
        Some(path) => warn!(
            path = %path.display(),
            "{ORT_DYLIB_ENV} points at a missing file"
        ),
        None => warn!("{ORT_DYLIB_ENV} not set, ONNX Runtime will use the default search paths"),
    }

    for path in &report.preloaded {
        debug!(path = %path.display(), "Preloaded GPU runtime library");
    }
}
