// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Renders the minimal Go module that gets built inside the pinned
//! toolchain container.

use std::path::Path;

use semver::Version;

use crate::{errors::GenError, manifest::Manifest};

/// Writes `main.go` and `go.mod` for one (manifest, app-version,
/// toolchain) job into `dir`.
pub fn render_app(
    dir: &Path,
    manifest: &Manifest,
    app_version: &Version,
    toolchain: &Version,
) -> Result<(), GenError> {
    std::fs::write(dir.join("main.go"), manifest.main_go)?;
    std::fs::write(
        dir.join("go.mod"),
        go_mod(manifest, app_version, toolchain),
    )?;
    Ok(())
}

fn go_mod(manifest: &Manifest, app_version: &Version, toolchain: &Version) -> String {
    let mut contents = format!(
        "module gotel.dev/offsets/app\n\ngo {}.{}\n",
        toolchain.major, toolchain.minor
    );
    if let Some(module) = manifest.module {
        contents.push_str(&format!("\nrequire {module} v{app_version}\n"));
    }
    contents
}

#[cfg(test)]
mod test {
    use crate::manifest::built_in_manifests;

    use super::*;

    #[test]
    fn test_go_mod_pins_the_library_version() {
        let manifests = built_in_manifests();
        let grpc = manifests
            .iter()
            .find(|m| m.module.is_some())
            .expect("a module-backed manifest");
        let contents = go_mod(grpc, &Version::new(1, 60, 1), &Version::new(1, 22, 0));
        assert!(contents.contains("go 1.22\n"));
        assert!(contents.contains("require google.golang.org/grpc v1.60.1\n"));
    }

    #[test]
    fn test_stdlib_go_mod_has_no_requires() {
        let manifests = built_in_manifests();
        let runtime = &manifests[0];
        let contents = go_mod(runtime, &Version::new(1, 21, 0), &Version::new(1, 21, 0));
        assert!(!contents.contains("require"));
    }
}
