//! Shader directory: GLSL sources compiled to SPIR-V with shaderc, cached
//! by file name, and re-checked by mtime polling for hot reload.
//!
//! A failed recompile keeps the previous bytecode and advances the stored
//! timestamp, so one broken save is reported once and the renderer keeps
//! running on the last good pipeline.

use log::{error, info};
use shaderc;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

struct ShaderEntry {
    path: PathBuf,
    bytecode: Vec<u32>,
    /// Include files observed during the last compile; polled alongside
    /// the source itself.
    includes: Vec<PathBuf>,
    /// Newest mtime across source and includes at the last compile attempt,
    /// successful or not.
    last_seen: SystemTime,
}

/// Watches one directory of GLSL shaders and owns their SPIR-V bytecode.
pub struct ShaderDirectory {
    root: PathBuf,
    compiler: shaderc::Compiler,
    entries: HashMap<String, ShaderEntry>,
}

impl ShaderDirectory {
    pub fn new(root: &Path) -> Result<Self, String> {
        if !root.is_dir() {
            return Err(format!("Shader directory not found: {}", root.display()));
        }
        let compiler = shaderc::Compiler::new()
            .ok_or_else(|| "Failed to initialize shaderc compiler".to_string())?;
        Ok(ShaderDirectory {
            root: root.to_path_buf(),
            compiler,
            entries: HashMap::new(),
        })
    }

    /// Compile and cache one shader by file name (e.g. "trace.rgen").
    /// Failure on first load is fatal; there is no bytecode to fall back to.
    pub fn load(&mut self, name: &str) -> Result<(), String> {
        let path = self.root.join(name);
        let (bytecode, includes) = compile_shader(&self.compiler, &self.root, &path)?;
        let last_seen = newest_mtime(&path, &includes);
        info!("Compiled shader '{}' ({} words)", name, bytecode.len());
        self.entries.insert(
            name.to_string(),
            ShaderEntry {
                path,
                bytecode,
                includes,
                last_seen,
            },
        );
        Ok(())
    }

    /// Cached SPIR-V for a loaded shader.
    pub fn bytecode(&self, name: &str) -> Option<&[u32]> {
        self.entries.get(name).map(|e| e.bytecode.as_slice())
    }

    /// Re-check every loaded shader's source and includes. Returns true if
    /// any shader's bytecode actually changed, in which case the caller
    /// must rebuild pipelines built from it.
    pub fn poll(&mut self) -> bool {
        let mut any_changed = false;
        for (name, entry) in self.entries.iter_mut() {
            let seen = newest_mtime(&entry.path, &entry.includes);
            if seen <= entry.last_seen {
                continue;
            }
            // Record the observed timestamp whether or not the compile
            // succeeds, so a broken save is not re-reported every poll.
            entry.last_seen = seen;
            match compile_shader(&self.compiler, &self.root, &entry.path) {
                Ok((bytecode, includes)) => {
                    info!("Reloaded shader '{}'", name);
                    entry.bytecode = bytecode;
                    entry.includes = includes;
                    any_changed = true;
                }
                Err(e) => {
                    error!("Shader '{}' failed to recompile, keeping previous: {}", name, e);
                }
            }
        }
        any_changed
    }
}

/// Map a shader file extension to its shaderc kind.
fn shader_kind(path: &Path) -> Result<shaderc::ShaderKind, String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rgen") => Ok(shaderc::ShaderKind::RayGeneration),
        Some("rmiss") => Ok(shaderc::ShaderKind::Miss),
        Some("rchit") => Ok(shaderc::ShaderKind::ClosestHit),
        Some("comp") => Ok(shaderc::ShaderKind::Compute),
        other => Err(format!(
            "Unrecognized shader extension {:?} for {}",
            other,
            path.display()
        )),
    }
}

/// Compile one GLSL file to SPIR-V, resolving includes relative to `root`
/// and reporting which include files were read.
fn compile_shader(
    compiler: &shaderc::Compiler,
    root: &Path,
    path: &Path,
) -> Result<(Vec<u32>, Vec<PathBuf>), String> {
    let kind = shader_kind(path)?;
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read shader {}: {}", path.display(), e))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("Invalid shader path: {}", path.display()))?;

    let seen_includes = RefCell::new(Vec::new());
    let mut options = shaderc::CompileOptions::new()
        .ok_or_else(|| "Failed to create shaderc compile options".to_string())?;
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    // Ray tracing stages need SPIR-V 1.4.
    options.set_target_spirv(shaderc::SpirvVersion::V1_4);
    options.set_include_callback(|requested, _ty, _requesting, _depth| {
        let include_path = root.join(requested);
        let content = std::fs::read_to_string(&include_path).map_err(|e| {
            format!("Failed to read include {}: {}", include_path.display(), e)
        })?;
        seen_includes.borrow_mut().push(include_path.clone());
        Ok(shaderc::ResolvedInclude {
            resolved_name: include_path.to_string_lossy().into_owned(),
            content,
        })
    });

    let result = compiler.compile_into_spirv(&source, kind, file_name, "main", Some(&options));
    // The options hold the include callback's borrow of seen_includes.
    drop(options);
    let artifact = result.map_err(|e| format!("Failed to compile {}: {}", file_name, e))?;

    Ok((artifact.as_binary().to_vec(), seen_includes.into_inner()))
}

/// Newest mtime across a source file and its includes. Files that vanished
/// report as UNIX_EPOCH so a deleted include does not force recompiles.
fn newest_mtime(path: &Path, includes: &[PathBuf]) -> SystemTime {
    std::iter::once(path)
        .chain(includes.iter().map(|p| p.as_path()))
        .filter_map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const COMP_SOURCE: &str = "#version 450\n\
        #include \"common.glsl\"\n\
        layout(local_size_x = 1) in;\n\
        void main() { float v = kScale; }\n";

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn bump_mtime(dir: &Path, name: &str) {
        // Push the mtime into the future so coarse filesystem timestamp
        // granularity cannot hide the edit from the poll.
        let file = std::fs::File::options()
            .write(true)
            .open(dir.join(name))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
    }

    fn directory_with_shader() -> (tempfile::TempDir, ShaderDirectory) {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "common.glsl", "const float kScale = 1.0;\n");
        write(dir.path(), "blit.comp", COMP_SOURCE);
        let mut shaders = ShaderDirectory::new(dir.path()).unwrap();
        shaders.load("blit.comp").unwrap();
        (dir, shaders)
    }

    #[test]
    fn load_produces_bytecode() {
        let (_dir, shaders) = directory_with_shader();
        let bytecode = shaders.bytecode("blit.comp").unwrap();
        assert!(!bytecode.is_empty());
        assert_eq!(bytecode[0], 0x0723_0203); // SPIR-V magic
    }

    #[test]
    fn poll_without_changes_is_quiet() {
        let (_dir, mut shaders) = directory_with_shader();
        assert!(!shaders.poll());
    }

    #[test]
    fn editing_an_include_recompiles_the_includer() {
        let (dir, mut shaders) = directory_with_shader();
        write(dir.path(), "common.glsl", "const float kScale = 2.0;\n");
        bump_mtime(dir.path(), "common.glsl");
        assert!(shaders.poll());
        assert!(!shaders.bytecode("blit.comp").unwrap().is_empty());
    }

    #[test]
    fn failed_recompile_keeps_previous_bytecode() {
        let (dir, mut shaders) = directory_with_shader();
        let before = shaders.bytecode("blit.comp").unwrap().to_vec();

        write(dir.path(), "blit.comp", "this is not GLSL");
        bump_mtime(dir.path(), "blit.comp");
        assert!(!shaders.poll());
        assert_eq!(shaders.bytecode("blit.comp").unwrap(), before.as_slice());

        // The broken state was recorded; the next poll does not retry.
        assert!(!shaders.poll());
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(ShaderDirectory::new(Path::new("/nonexistent/shaders")).is_err());
    }
}
