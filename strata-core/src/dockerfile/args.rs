//! Build argument handling.
//!
//! Two argument scopes exist: *meta-args* declared before the first FROM
//! (usable inside FROM references) and per-stage args declared with ARG
//! inside a stage. Command-line overrides apply only where an ARG was
//! declared. A fixed set of platform args is always available for
//! substitution but never leaks into the image config unless explicitly
//! declared.

use std::collections::BTreeMap;

use crate::config::BuildOptions;
use crate::dockerfile::expand::ExpansionEnv;

/// Predefined platform argument names.
pub const PLATFORM_ARGS: &[&str] = &[
    "BUILDPLATFORM",
    "BUILDOS",
    "BUILDOSVERSION",
    "BUILDARCH",
    "BUILDVARIANT",
    "TARGETPLATFORM",
    "TARGETOS",
    "TARGETOSVERSION",
    "TARGETARCH",
    "TARGETVARIANT",
    "TARGETSTAGE",
];

/// Arguments available to one stage's instructions.
#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
    /// Args declared in the current stage, with their effective values.
    declared: BTreeMap<String, String>,
    /// Meta-args, usable by FROM and inherited into ARG declarations.
    meta: BTreeMap<String, String>,
    /// Predefined platform args.
    predefined: BTreeMap<String, String>,
    /// Raw command-line overrides (`K=V`).
    overrides: BTreeMap<String, String>,
}

impl BuildArgs {
    pub fn new(cli_args: &[String]) -> Self {
        let mut overrides = BTreeMap::new();
        for arg in cli_args {
            match arg.split_once('=') {
                Some((k, v)) if !v.is_empty() => {
                    overrides.insert(k.to_string(), v.to_string());
                }
                Some((k, _)) => {
                    // `--build-arg K=` passes the builder's environment value.
                    if let Ok(v) = std::env::var(k) {
                        overrides.insert(k.to_string(), v);
                    }
                }
                None => {
                    if let Ok(v) = std::env::var(arg) {
                        overrides.insert(arg.to_string(), v);
                    }
                }
            }
        }
        Self { overrides, ..Default::default() }
    }

    /// Register a meta-arg with its effective (already expanded) value.
    pub fn add_meta(&mut self, name: &str, value: Option<&str>) {
        let effective = self
            .overrides
            .get(name)
            .cloned()
            .or_else(|| value.map(String::from));
        if let Some(v) = effective {
            self.meta.insert(name.to_string(), v);
        }
    }

    /// Handle an in-stage `ARG` declaration. The override wins; otherwise
    /// the declared default applies; otherwise a matching meta-arg value
    /// is inherited.
    pub fn declare(&mut self, name: &str, default: Option<&str>) {
        let effective = self
            .overrides
            .get(name)
            .cloned()
            .or_else(|| default.map(String::from))
            .or_else(|| self.meta.get(name).cloned());
        if let Some(v) = effective {
            self.declared.insert(name.to_string(), v);
        }
    }

    /// Seed every name in [`PLATFORM_ARGS`] for the target platform.
    pub fn register_platform_args(&mut self, opts: &BuildOptions, target_stage: Option<&str>) {
        let build_os = std::env::consts::OS.to_string();
        let build_arch = normalize_arch(std::env::consts::ARCH).to_string();
        let build_platform = format!("{build_os}/{build_arch}");

        let (target_platform, target_os, target_arch, target_variant) =
            match opts.custom_platform.as_deref() {
                Some(platform) => {
                    let mut parts = platform.splitn(3, '/');
                    let os = parts.next().unwrap_or("linux").to_string();
                    let arch = parts.next().unwrap_or(&build_arch).to_string();
                    let variant = parts.next().unwrap_or("").to_string();
                    (platform.to_string(), os, arch, variant)
                }
                None => (build_platform.clone(), build_os.clone(), build_arch.clone(), String::new()),
            };

        for &name in PLATFORM_ARGS {
            let value = match name {
                "BUILDPLATFORM" => build_platform.clone(),
                "BUILDOS" => build_os.clone(),
                "BUILDARCH" => build_arch.clone(),
                "TARGETPLATFORM" => target_platform.clone(),
                "TARGETOS" => target_os.clone(),
                "TARGETARCH" => target_arch.clone(),
                "TARGETVARIANT" => target_variant.clone(),
                "TARGETSTAGE" => target_stage.unwrap_or("default").to_string(),
                // OS versions and the build variant are not probed.
                _ => String::new(),
            };
            self.predefined.insert(name.to_string(), value);
        }
    }

    /// The environment used to expand instruction words: image env first,
    /// shadowed by predefined platform args, then declared args.
    pub fn expansion_env<'a>(
        &'a self,
        image_env: &'a BTreeMap<String, String>,
    ) -> ExpansionEnv<'a> {
        ExpansionEnv::new().push(image_env).push(&self.predefined).push(&self.declared)
    }

    /// The environment available to FROM references: meta-args and
    /// predefined platform args only.
    pub fn meta_env(&self) -> ExpansionEnv<'_> {
        ExpansionEnv::new().push(&self.predefined).push(&self.meta)
    }

    /// Declared args as `K=V` pairs for the fingerprint composite.
    pub fn declared_pairs(&self) -> Vec<(String, String)> {
        self.declared.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn declared_value(&self, name: &str) -> Option<&str> {
        self.declared.get(name).map(String::as_str)
    }

    pub fn meta_value(&self, name: &str) -> Option<&str> {
        self.meta.get(name).map(String::as_str)
    }

    pub fn override_value(&self, name: &str) -> Option<&str> {
        self.overrides.get(name).map(String::as_str)
    }
}

/// Docker platform arch names differ from Rust's.
pub fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
