//! Locating external executables and the ONNX Runtime shared library.
//!
//! Binaries shipped next to the executable (or in a `bin/` directory beside it
//! or the working directory) win over whatever is on `PATH`.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("bin"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.clone());
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

fn path_dirs() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|p| env::split_paths(&p).filter(|d| !d.as_os_str().is_empty()).collect())
        .unwrap_or_default()
}

fn binary_file_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = binary_file_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Absolute path of `binary` from the bundled locations, then `PATH`.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    find_binary_in_dirs(binary, &candidate_bin_dirs())
        .or_else(|| find_binary_in_dirs(binary, &path_dirs()))
}

/// Static availability probe used by backends and the doctor report.
pub fn binary_available(binary: &str) -> bool {
    resolve_binary(binary).is_some()
}

pub fn command_for(binary: &str) -> Command {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// The ONNX Runtime library ort will load, if one can be found.
pub fn ort_library_path() -> Option<PathBuf> {
    if let Some(explicit) = env::var_os("ORT_DYLIB_PATH") {
        let path = PathBuf::from(explicit);
        return path.is_file().then_some(path);
    }
    candidate_lib_dirs()
        .into_iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|p| p.is_file())
}

/// Load order for GPU runtime libraries: CUDA, then cuDNN, then TensorRT.
/// ONNX Runtime's own provider libraries are left to ort.
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"].iter().any(|p| name.starts_with(p)) {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

fn is_shared_lib(name: &str, path: &Path) -> bool {
    if cfg!(windows) {
        name.to_ascii_lowercase().ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

fn gpu_libs_in(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|e| e.path()) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !is_shared_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }
    libs.sort();
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
fn preload(path: &Path) -> bool {
    // SAFETY: loading a shared library runs its initialisers; these are the
    // vendor GPU runtimes that ort would load anyway.
    match unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn preload(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point ort at a bundled ONNX Runtime and preload GPU runtimes it links
/// against. Call before the first ort session is built.
pub fn setup_runtime_libs() -> Vec<PathBuf> {
    let dirs = candidate_lib_dirs();
    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = dirs.iter().map(|d| d.join(ORT_LIB_NAME)).find(|p| p.is_file()) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }
    }

    gpu_libs_in(&dirs)
        .into_iter()
        .filter(|path| preload(path))
        .inspect(|path| debug!(lib = %path.display(), "Preloaded GPU runtime library"))
        .collect()
}

pub fn log_runtime_lib_status() {
    match env::var_os("ORT_DYLIB_PATH").map(PathBuf::from) {
        Some(path) if path.is_file() => info!("ORT library: {}", path.display()),
        Some(path) => warn!("ORT_DYLIB_PATH set to {} but file not found", path.display()),
        None => debug!("ORT_DYLIB_PATH not set, ort will use its default search"),
    }
}
