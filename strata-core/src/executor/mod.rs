//! Build orchestration.
//!
//! Drives the planned stages sequentially: materialize the base image,
//! seed the snapshot baseline, route each instruction through the step
//! executor (or the layer cache), snapshot filesystem changes into
//! layers, persist save-stages for later `COPY --from`, and hand the
//! final stage to the assembler. `--dryrun` renders the plan instead and
//! touches neither the filesystem nor the network.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::cache::{self, CacheResult, LayerStore, LocalLayerStore, RemoteLayerStore};
use crate::config::{BuildOptions, FeatureFlags};
use crate::context;
use crate::dockerfile::parser::{self, InstructionKind};
use crate::dockerfile::{
    self, BaseConfigSource, BuildArgs, Instruction, NoRemoteBase, Plan, ResolvedStage,
};
use crate::error::{Result, StrataError};
use crate::exec::{self, ExecutedStep, StepContext, StepOutcome};
use crate::image::push::{self, PushedTag};
use crate::image::remote::{self, ImageClient};
use crate::image::{assemble, HistoryRecord, ImageConfigFile, Layer, Platform};
use crate::paths::{BuilderDirs, IgnoreList};
use crate::snapshot::{LayerSink, Snapshotter};
use crate::warmer;

/// The result of a build.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    /// The final image digest; absent for dry runs.
    pub digest: Option<String>,
    pub pushed: Vec<PushedTag>,
}

/// Build with the live root filesystem at `/`.
pub async fn do_build(opts: &BuildOptions) -> Result<BuildOutcome> {
    let mut stdout = std::io::stdout();
    do_build_in_root(opts, Path::new("/"), &mut stdout).await
}

/// Build against an explicit root (tests use a scratch directory).
/// Dry-run plan output goes to `out`.
#[instrument(skip_all, fields(dockerfile = %opts.dockerfile_path))]
pub async fn do_build_in_root(
    opts: &BuildOptions,
    root: &Path,
    out: &mut dyn std::io::Write,
) -> Result<BuildOutcome> {
    let flags = FeatureFlags::from_env();
    let platform = opts
        .custom_platform
        .as_deref()
        .map(Platform::parse)
        .unwrap_or_else(Platform::host);

    let content = read_dockerfile(opts).await?;
    let dockerfile = parser::parse(&content).map_err(|e| StrataError::InvalidDockerfile {
        path: opts.dockerfile_path.clone().into(),
        source: e,
    })?;

    if opts.dryrun {
        // Planning must stay off the network: remote ONBUILD triggers are
        // not unfolded in a dry run.
        let plan = dockerfile::plan(dockerfile, opts, &flags, &NoRemoteBase).await?;
        render_plan(&plan, opts, out)?;
        return Ok(BuildOutcome::default());
    }

    let pull_client = ImageClient::for_pull(&opts.registry, &platform);
    let base_source = RegistryBaseSource { client: &pull_client };
    let plan = dockerfile::plan(dockerfile, opts, &flags, &base_source).await?;

    let mut session = BuildSession::new(opts, flags, platform, pull_client, root.to_path_buf())?;
    session.run(&plan, out).await
}

/// Fetches `ONBUILD` triggers for remote base images during planning.
struct RegistryBaseSource<'a> {
    client: &'a ImageClient,
}

#[async_trait]
impl BaseConfigSource for RegistryBaseSource<'_> {
    async fn onbuild_triggers(&self, image: &str) -> Result<Vec<String>> {
        Ok(self.client.fetch_config(image).await?.config.onbuild)
    }
}

/// Render the dry-run plan: one line per instruction, annotated with
/// whether it can hit the cache and whether it produces a layer.
fn render_plan(plan: &Plan, opts: &BuildOptions, out: &mut dyn std::io::Write) -> Result<()> {
    let write_err = |e| StrataError::io("<plan output>", e);
    for (idx, stage) in plan.stages.iter().enumerate() {
        let mut markers = String::new();
        if stage.save_stage {
            markers.push_str(" (save)");
        }
        if stage.final_stage {
            markers.push_str(" (final)");
        }
        writeln!(out, "stage {idx}: {}{markers}", stage.stage.raw_from).map_err(write_err)?;
        for inst in &stage.stage.instructions {
            let mut annotation =
                if exec::is_metadata_only(inst) { "meta".to_string() } else { "layer".to_string() };
            if opts.cache_enabled && exec::is_cacheable(inst, opts) {
                annotation.push_str(" cached");
            }
            writeln!(out, "  {} [{annotation}]", inst.raw).map_err(write_err)?;
        }
    }
    Ok(())
}

/// Saved state of a completed stage, for later stages that build on it.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SavedStage {
    config: ImageConfigFile,
    layers: Vec<Layer>,
}

/// Per-build state shared across stages.
struct BuildSession<'a> {
    opts: &'a BuildOptions,
    flags: FeatureFlags,
    platform: Platform,
    client: ImageClient,
    dirs: BuilderDirs,
    root: PathBuf,
    context_dir: PathBuf,
    http: reqwest::Client,
    cache_store: Option<Box<dyn LayerStore>>,
    layer_seq: usize,
}

impl<'a> BuildSession<'a> {
    fn new(
        opts: &'a BuildOptions,
        flags: FeatureFlags,
        platform: Platform,
        client: ImageClient,
        root: PathBuf,
    ) -> Result<Self> {
        let dirs = BuilderDirs::new(&opts.builder_dir);
        dirs.ensure()?;
        if opts.pre_cleanup {
            dirs.cleanup_intermediate()?;
        }
        dirs.assert_swap_empty()?;

        let context_dir = context::acquire(opts, &dirs.build_context())?;

        let cache_store: Option<Box<dyn LayerStore>> = if !opts.cache_enabled {
            None
        } else if let Some(repo) = &opts.cache_repo {
            let cache_client = ImageClient::for_push(&opts.registry, &platform);
            Some(Box::new(RemoteLayerStore::new(
                cache_client,
                repo.clone(),
                dirs.layer_cache(),
                opts.cache.cache_ttl,
            )?))
        } else {
            Some(Box::new(LocalLayerStore::new(dirs.layer_cache(), opts.cache.cache_ttl)?))
        };

        Ok(Self {
            opts,
            flags,
            platform,
            client,
            dirs,
            root,
            context_dir,
            http: reqwest::Client::new(),
            cache_store,
            layer_seq: 0,
        })
    }

    fn ignore_list(&self) -> IgnoreList {
        let mut ignore =
            IgnoreList::new(self.dirs.root(), self.opts.ignore_var_run, &self.opts.ignore_paths);
        // An in-place build context must never leak into layers.
        if self.context_dir.starts_with(&self.root) && self.root != Path::new("/") {
            if let Ok(rel) = self.context_dir.strip_prefix(&self.root) {
                ignore.add(Path::new("/").join(rel));
            }
        } else if self.root == Path::new("/") {
            ignore.add(self.context_dir.clone());
        }
        ignore
    }

    async fn run(&mut self, plan: &Plan, out: &mut dyn std::io::Write) -> Result<BuildOutcome> {
        let target_name = plan.stages.last().and_then(|s| s.stage.name.clone());
        let mut outcome = BuildOutcome::default();

        for (idx, stage) in plan.stages.iter().enumerate() {
            self.dirs.assert_swap_empty()?;
            if idx > 0 && !self.flags.skip_interstage_cleanup {
                clean_rootfs(&self.root, &self.ignore_list(), self.dirs.root())?;
            }

            info!(stage = idx, base = %stage.stage.base_name, "building stage");
            let result = self.run_stage(plan, stage, idx, target_name.as_deref()).await?;

            if stage.save_stage {
                self.save_stage(idx, &result)?;
            }
            if stage.final_stage {
                outcome = self.finish(result, out).await?;
            }
            self.dirs.assert_swap_empty()?;
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(stage = index))]
    async fn run_stage(
        &mut self,
        plan: &Plan,
        stage: &ResolvedStage,
        index: usize,
        target_name: Option<&str>,
    ) -> Result<StageState> {
        // Base image: scratch, a previous stage, or a remote image.
        let (mut config, base_layers) = self.materialize_base(stage).await?;

        let mut args = BuildArgs::new(&self.opts.build_args);
        for meta_arg in &plan.meta_args {
            args.add_meta(&meta_arg.name, meta_arg.value.as_deref());
        }
        args.register_platform_args(self.opts, target_name);

        let mut snapshotter =
            Snapshotter::new(&self.root, self.ignore_list(), self.opts.snapshot_mode);
        snapshotter.seed_baseline()?;

        let from_dirs = self.materialize_from_sources(stage).await?;
        let mut records: Vec<HistoryRecord> = Vec::new();
        // Layers produced so far, chained into every later fingerprint so
        // a step's cache key depends on everything before it.
        let mut produced_diff_ids: Vec<String> = config.rootfs.diff_ids.clone();

        for inst in &stage.stage.instructions {
            let ctx = StepContext {
                root: &self.root,
                context_dir: &self.context_dir,
                dirs: &self.dirs,
                opts: self.opts,
                flags: &self.flags,
                http: &self.http,
                from_dirs: &from_dirs,
                secrets: &self.opts.secrets,
            };

            if exec::is_metadata_only(inst) {
                exec::execute_step(inst, &mut config, &mut args, &ctx).await?;
                records.push(HistoryRecord { created_by: inst.raw.clone(), layer: None });
                continue;
            }

            // Cache lookup happens before execution; a hit replaces the
            // child process with extraction of the cached layer.
            let cacheable = !self.opts.single_snapshot
                && self.cache_store.is_some()
                && exec::is_cacheable(inst, self.opts);
            let fingerprint = if cacheable {
                let mut fp_config = config.clone();
                fp_config.rootfs.diff_ids = produced_diff_ids.clone();
                Some(self.fingerprint_for(inst, &fp_config, &args, &from_dirs)?)
            } else {
                None
            };

            if let (Some(fp), Some(store)) = (&fingerprint, self.cache_store.as_deref()) {
                match store.lookup(fp).await? {
                    CacheResult::Hit(cached) => {
                        match self.apply_cached(inst, cached, &mut config, &mut args, &mut snapshotter, &ctx).await {
                            Ok(record) => {
                                if let Some(layer) = &record.layer {
                                    produced_diff_ids.push(layer.diff_id.clone());
                                }
                                records.push(record);
                                continue;
                            }
                            Err(e) => {
                                // Corrupt cache entries trigger a rebuild,
                                // never a failed build.
                                warn!(fingerprint = %fp, error = %e, "cached layer unusable, rebuilding");
                            }
                        }
                    }
                    CacheResult::Expired | CacheResult::Miss => {
                        debug!(fingerprint = %fp, "cache miss");
                    }
                }
            }

            let executed = exec::execute_step(inst, &mut config, &mut args, &ctx).await?;
            let layer = self.snapshot_step(&mut snapshotter, &executed)?;

            if let (Some(fp), Some(store)) = (&fingerprint, self.cache_store.as_deref()) {
                let cache_to_remote = self.opts.cache_repo.is_some();
                if !(cache_to_remote && self.opts.no_push_cache) {
                    store.store(fp, layer.as_ref(), &inst.raw).await?;
                }
            }
            if let Some(layer) = &layer {
                produced_diff_ids.push(layer.diff_id.clone());
            }
            records.push(HistoryRecord { created_by: inst.raw.clone(), layer });
        }

        // Single-snapshot mode bundles the whole stage into one layer,
        // attached to the stage's last instruction.
        if self.opts.single_snapshot {
            let sink = self.next_sink();
            if let Some(layer) = snapshotter.take_full_snapshot(&sink)? {
                match records.last_mut() {
                    Some(record) => record.layer = Some(layer),
                    None => records.push(HistoryRecord {
                        created_by: stage.stage.raw_from.clone(),
                        layer: Some(layer),
                    }),
                }
            }
        }

        Ok(StageState { config, base_layers, records })
    }

    /// Replay a cache hit: extract the cached layer into the rootfs in
    /// place of executing the step. Only `WORKDIR` re-runs its (cheap)
    /// config mutation; `RUN`, `COPY` and `ADD` are skipped entirely.
    #[allow(clippy::too_many_arguments)]
    async fn apply_cached(
        &self,
        inst: &Instruction,
        cached: crate::cache::CachedLayer,
        config: &mut ImageConfigFile,
        args: &mut BuildArgs,
        snapshotter: &mut Snapshotter,
        ctx: &StepContext<'_>,
    ) -> Result<HistoryRecord> {
        if let Some(layer) = &cached.layer {
            let blob =
                std::fs::read(&layer.path).map_err(|e| StrataError::io(&layer.path, e))?;
            let touched = remote::apply_layer_tar(&blob, &self.root)?;
            snapshotter.refresh_paths(&touched)?;
        }
        if matches!(inst.kind, InstructionKind::Workdir { .. }) {
            exec::execute_step(inst, config, args, ctx).await?;
        }
        info!(step = %inst.raw, "using cached layer");
        Ok(HistoryRecord { created_by: inst.raw.clone(), layer: cached.layer })
    }

    /// Materialize the stage's base: returns its config and layer blobs,
    /// with the root filesystem extracted and ready.
    async fn materialize_base(
        &mut self,
        stage: &ResolvedStage,
    ) -> Result<(ImageConfigFile, Vec<Layer>)> {
        if let Some(base_index) = stage.base_image_index {
            let saved = self.load_stage(base_index)?;
            let tar_path = self.dirs.stage_tarball(base_index);
            let data = std::fs::read(&tar_path).map_err(|e| StrataError::io(&tar_path, e))?;
            remote::apply_layer_tar(&data, &self.root)?;
            return Ok((saved.config, saved.layers));
        }
        if stage.base_is_scratch() {
            return Ok((ImageConfigFile::scratch(&self.platform), Vec::new()));
        }

        let pulled = self.pull_base(&stage.stage.base_name).await?;
        let mut attempts = 0u32;
        loop {
            match remote::extract_rootfs(&pulled, &self.root) {
                Ok(_) => break,
                Err(e) if attempts < self.opts.image_fs_extract_retry => {
                    attempts += 1;
                    warn!(error = %e, attempt = attempts, "rootfs extraction failed, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(500 << attempts.min(4)));
                }
                Err(e) => return Err(e),
            }
        }

        // Keep the base blobs on disk: the final manifest references them.
        let mut layers = Vec::with_capacity(pulled.layers.len());
        for (i, blob) in pulled.layers.iter().enumerate() {
            let digest = crate::image::sha256_digest(&blob.data);
            let path = self.dirs.layer_cache().join(digest.trim_start_matches("sha256:"));
            if !path.exists() {
                std::fs::write(&path, &blob.data).map_err(|e| StrataError::io(&path, e))?;
            }
            let diff_id = pulled
                .config
                .rootfs
                .diff_ids
                .get(i)
                .cloned()
                .unwrap_or_else(|| digest.clone());
            layers.push(Layer {
                diff_id,
                digest,
                media_type: blob.media_type.clone(),
                size: blob.data.len() as u64,
                path,
            });
        }
        Ok((pulled.config, layers))
    }

    /// Pull a base image, preferring the warmed local cache when enabled.
    async fn pull_base(&self, image: &str) -> Result<remote::PulledImage> {
        if self.opts.cache_enabled && !self.flags.ignore_cached_manifest {
            let reference = remote::normalize_reference(image)?;
            let digest = match reference.digest() {
                Some(d) => Some(d.to_string()),
                None => self.client.manifest_digest(image).await.ok(),
            };
            if let Some(digest) = digest {
                if let Some(cached) = warmer::load_cached_image(
                    &self.opts.cache.cache_dir,
                    &digest,
                    self.opts.cache.cache_ttl,
                )? {
                    info!(image, %digest, "using warmed base image");
                    return Ok(cached);
                }
            }
        }
        self.client.pull(image).await
    }

    /// Extract `--from` source trees into the deps store, once per key.
    async fn materialize_from_sources(
        &self,
        stage: &ResolvedStage,
    ) -> Result<BTreeMap<String, PathBuf>> {
        let mut out = BTreeMap::new();
        for inst in &stage.stage.instructions {
            let from = match &inst.kind {
                InstructionKind::Copy(spec) => spec.from.clone(),
                InstructionKind::Add(spec) => spec.from.clone(),
                _ => None,
            };
            let Some(from) = from else { continue };
            if out.contains_key(&from) {
                continue;
            }

            let dir = if from.parse::<usize>().is_ok() {
                let dir = self.dirs.stage_deps(&from);
                if !dir.exists() {
                    let tar_path = self.dirs.stage_tarball(from.parse().expect("checked"));
                    let data =
                        std::fs::read(&tar_path).map_err(|e| StrataError::io(&tar_path, e))?;
                    std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
                    remote::apply_layer_tar(&data, &dir)?;
                }
                dir
            } else {
                // An image reference: unpack its layers once.
                let dir = self.dirs.stage_deps(&sanitize_ref(&from));
                if !dir.exists() {
                    info!(image = %from, "fetching COPY --from image");
                    let pulled = self.client.pull(&from).await?;
                    std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
                    remote::extract_rootfs(&pulled, &dir)?;
                }
                dir
            };
            out.insert(from, dir);
        }
        Ok(out)
    }

    fn next_sink(&mut self) -> LayerSink {
        self.layer_seq += 1;
        LayerSink {
            output: self.dirs.layer_cache().join(format!("layer-{}", self.layer_seq)),
            compression: self.opts.compression,
            compression_level: self.opts.compression_level,
            reproducible: self.opts.reproducible,
        }
    }

    fn snapshot_step(
        &mut self,
        snapshotter: &mut Snapshotter,
        executed: &ExecutedStep,
    ) -> Result<Option<Layer>> {
        if self.opts.single_snapshot {
            return Ok(None);
        }
        let sink = self.next_sink();
        match &executed.outcome {
            StepOutcome::Metadata => Ok(None),
            StepOutcome::Files(files) => snapshotter.take_targeted_snapshot(files, &sink),
            StepOutcome::FullScan => snapshotter.take_full_snapshot(&sink),
        }
    }

    /// Fingerprint a step before executing it.
    fn fingerprint_for(
        &self,
        inst: &Instruction,
        config: &ImageConfigFile,
        args: &BuildArgs,
        from_dirs: &BTreeMap<String, PathBuf>,
    ) -> Result<String> {
        let command = exec::canonical_command(inst, config);
        let args_envs = exec::requires_args_in_cache_key(inst).then(|| args.declared_pairs());
        let fragment = config.fingerprint_fragment();

        let sources = match &inst.kind {
            InstructionKind::Copy(spec) => {
                let base = match &spec.from {
                    Some(from) => from_dirs
                        .get(from)
                        .cloned()
                        .unwrap_or_else(|| self.context_dir.clone()),
                    None => self.context_dir.clone(),
                };
                self.source_digests(&base, &spec.sources, config, args, inst.line)?
            }
            InstructionKind::Add(spec) => {
                let locals: Vec<String> = spec
                    .sources
                    .iter()
                    .filter(|s| !s.starts_with("http://") && !s.starts_with("https://"))
                    .cloned()
                    .collect();
                let base = match &spec.from {
                    Some(from) => from_dirs
                        .get(from)
                        .cloned()
                        .unwrap_or_else(|| self.context_dir.clone()),
                    None => self.context_dir.clone(),
                };
                self.source_digests(&base, &locals, config, args, inst.line)?
            }
            _ => Vec::new(),
        };

        Ok(cache::compose(&command, args_envs.as_deref(), &fragment, &sources))
    }

    fn source_digests(
        &self,
        base: &Path,
        patterns: &[String],
        config: &ImageConfigFile,
        args: &BuildArgs,
        line: usize,
    ) -> Result<Vec<cache::SourceDigest>> {
        let mut throwaway = BTreeMap::new();
        let expanded: Vec<String> = patterns
            .iter()
            .map(|p| exec::meta::expand_word(p, config, args, &mut throwaway, line))
            .collect::<Result<_>>()?;
        let resolved = exec::copy::resolve_sources(base, &expanded)?;
        cache::digest_sources(base, &resolved)
    }

    fn save_stage(&self, index: usize, state: &StageState) -> Result<()> {
        let tar_path = self.dirs.stage_tarball(index);
        write_rootfs_tar(&self.root, &self.ignore_list(), &tar_path)?;

        let saved = SavedStage {
            config: state.config.clone(),
            layers: state.all_layers(),
        };
        let meta_path = self.stage_meta_path(index);
        std::fs::write(&meta_path, serde_json::to_vec(&saved)?)
            .map_err(|e| StrataError::io(&meta_path, e))?;
        info!(stage = index, "saved intermediate stage");
        Ok(())
    }

    fn load_stage(&self, index: usize) -> Result<SavedStage> {
        let meta_path = self.stage_meta_path(index);
        let raw = std::fs::read(&meta_path).map_err(|e| StrataError::io(&meta_path, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn stage_meta_path(&self, index: usize) -> PathBuf {
        self.dirs.root().join("stages").join(format!("{index}.json"))
    }

    /// Assemble, export and push the final image.
    async fn finish(
        &self,
        state: StageState,
        out: &mut dyn std::io::Write,
    ) -> Result<BuildOutcome> {
        let StageState { mut config, base_layers, records } = state;
        for label in &self.opts.labels {
            if let Some((k, v)) = label.split_once('=') {
                config.config.labels.insert(k.to_string(), v.to_string());
            }
        }

        let image = assemble::assemble(
            config,
            base_layers,
            records,
            &self.platform,
            self.flags.oci_stages,
            &self.opts.annotations,
            self.opts.reproducible,
        )?;

        info!(digest = %image.digest, layers = image.layers.len(), "image assembled");

        if let Some(tar_path) = &self.opts.tar_path {
            push::write_tarball(&image, &self.opts.destinations, tar_path)?;
        }
        if let Some(layout) = &self.opts.oci_layout_path {
            push::write_oci_layout(&image, layout)?;
        }

        let pushed = if self.opts.no_push || self.opts.destinations.is_empty() {
            if self.opts.destinations.is_empty() && !self.opts.no_push {
                return Err(StrataError::InvalidOptions {
                    reason: "no --destination provided; use --no-push to build without pushing"
                        .to_string(),
                });
            }
            Vec::new()
        } else {
            let push_client = ImageClient::for_push(&self.opts.registry, &self.platform);
            push::push_image(&push_client, &image, &self.opts.destinations).await?
        };

        push::write_digest_files(
            &image.digest,
            &pushed,
            self.opts.digest_file.as_deref(),
            self.opts.image_name_digest_file.as_deref(),
            self.opts.image_name_tag_digest_file.as_deref(),
        )?;

        writeln!(out, "{}", image.digest).map_err(|e| StrataError::io("<output>", e))?;
        Ok(BuildOutcome { digest: Some(image.digest.clone()), pushed })
    }
}

/// Accumulated output of one stage.
struct StageState {
    config: ImageConfigFile,
    base_layers: Vec<Layer>,
    records: Vec<HistoryRecord>,
}

impl StageState {
    fn all_layers(&self) -> Vec<Layer> {
        let mut out = self.base_layers.clone();
        out.extend(self.records.iter().filter_map(|r| r.layer.clone()));
        out
    }
}

/// Read the Dockerfile from a path or an http(s) URL.
async fn read_dockerfile(opts: &BuildOptions) -> Result<String> {
    let path = &opts.dockerfile_path;
    if path.starts_with("http://") || path.starts_with("https://") {
        let response = reqwest::get(path).await.and_then(reqwest::Response::error_for_status);
        let body = match response {
            Ok(r) => r.text().await,
            Err(e) => {
                return Err(StrataError::Context {
                    reason: format!("fetching Dockerfile {path}: {e}"),
                })
            }
        };
        return body.map_err(|e| StrataError::Context {
            reason: format!("reading Dockerfile {path}: {e}"),
        });
    }
    std::fs::read_to_string(path).map_err(|e| StrataError::io(path.clone(), e))
}

/// Remove everything under the root that is not on the ignore list.
fn clean_rootfs(root: &Path, ignore: &IgnoreList, builder_root: &Path) -> Result<()> {
    if root == Path::new("/") && !builder_root.exists() && !Path::new("/.dockerenv").exists() {
        // A bare host root outside a build container is never wiped.
        return Err(StrataError::FilesystemInvariant {
            reason: "refusing to clean / outside a build container".to_string(),
        });
    }
    for entry in std::fs::read_dir(root).map_err(|e| StrataError::io(root, e))? {
        let entry = entry.map_err(|e| StrataError::io(root, e))?;
        let abs = Path::new("/").join(entry.file_name());
        if ignore.is_ignored(&abs) {
            continue;
        }
        let path = entry.path();
        let meta = path.symlink_metadata().map_err(|e| StrataError::io(&path, e))?;
        let result = if meta.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| StrataError::io(&path, e))?;
    }
    Ok(())
}

/// Write the full root filesystem (minus ignores) as a plain tar.
fn write_rootfs_tar(root: &Path, ignore: &IgnoreList, out: &Path) -> Result<()> {
    let file = std::fs::File::create(out).map_err(|e| StrataError::io(out, e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    let mut it = walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name().into_iter();
    loop {
        let entry = match it.next() {
            None => break,
            Some(Ok(entry)) => entry,
            Some(Err(e)) => {
                debug!(error = %e, "skipping unreadable path while saving stage");
                continue;
            }
        };
        let rel = entry.path().strip_prefix(root).expect("walkdir stays under root");
        let abs = Path::new("/").join(rel);
        if ignore.is_ignored(&abs) {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            continue;
        }
        builder
            .append_path_with_name(entry.path(), rel)
            .map_err(|e| StrataError::io(entry.path(), e))?;
    }
    builder.finish().map_err(|e| StrataError::io(out, e))?;
    Ok(())
}

fn sanitize_ref(reference: &str) -> String {
    reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Runtime::new().unwrap().block_on(fut)
    }

    fn dryrun_opts(dir: &Path, dockerfile: &str) -> BuildOptions {
        let df_path = dir.join("Dockerfile");
        std::fs::write(&df_path, dockerfile).unwrap();
        BuildOptions {
            dockerfile_path: df_path.display().to_string(),
            src_context: dir.display().to_string(),
            builder_dir: dir.join("kaniko"),
            dryrun: true,
            no_push: true,
            ..Default::default()
        }
    }

    fn plan_text(opts: &BuildOptions) -> String {
        let mut out = Vec::new();
        let root = TempDir::new().unwrap();
        block_on(do_build_in_root(opts, root.path(), &mut out)).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_dryrun_plan_shape() {
        let tmp = TempDir::new().unwrap();
        let opts = dryrun_opts(
            tmp.path(),
            "FROM alpine:3.19\nENV A=1\nRUN echo hi\nCOPY f /f\n",
        );
        let plan = plan_text(&opts);
        assert_eq!(
            plan,
            "stage 0: FROM alpine:3.19 (final)\n  ENV A=1 [meta]\n  RUN echo hi [layer]\n  COPY f /f [layer]\n"
        );
    }

    #[test]
    fn test_dryrun_plan_deterministic() {
        let tmp = TempDir::new().unwrap();
        let opts = dryrun_opts(
            tmp.path(),
            "FROM golang:1.21 AS build\nRUN go build ./...\n\nFROM alpine\nCOPY --from=build /x /x\n",
        );
        let a = plan_text(&opts);
        let b = plan_text(&opts);
        assert_eq!(a, b);
        assert!(a.contains("stage 0: FROM golang:1.21 AS build (save)\n"));
        assert!(a.contains("stage 1: FROM alpine (final)\n"));
        assert!(a.contains("  COPY --from=build /x /x [layer]\n"));
    }

    #[test]
    fn test_dryrun_cache_annotations() {
        let tmp = TempDir::new().unwrap();
        let mut opts = dryrun_opts(tmp.path(), "FROM alpine\nRUN echo hi\nCOPY f /f\n");
        opts.cache_enabled = true;
        opts.cache_run_layers = true;
        opts.cache_copy_layers = false;
        let plan = plan_text(&opts);
        assert!(plan.contains("RUN echo hi [layer cached]"));
        assert!(plan.contains("COPY f /f [layer]"));
    }

    #[test]
    fn test_dryrun_never_touches_builder_dir() {
        let tmp = TempDir::new().unwrap();
        let opts = dryrun_opts(tmp.path(), "FROM alpine\nRUN echo hi\n");
        plan_text(&opts);
        assert!(!tmp.path().join("kaniko").exists());
    }

    #[test]
    fn test_clean_rootfs_respects_ignores() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("keepme")).unwrap();
        std::fs::create_dir_all(root.join("wipe")).unwrap();
        std::fs::write(root.join("wipe/file"), b"x").unwrap();

        let ignore = IgnoreList::new(Path::new("/kaniko"), false, &[PathBuf::from("/keepme")]);
        clean_rootfs(&root, &ignore, Path::new("/kaniko")).unwrap();
        assert!(root.join("keepme").exists());
        assert!(!root.join("wipe").exists());
    }

    #[test]
    fn test_write_rootfs_tar_excludes_ignored() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("proc")).unwrap();
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::write(root.join("app/bin"), b"x").unwrap();

        let out = tmp.path().join("stage.tar");
        let ignore = IgnoreList::new(Path::new("/kaniko"), false, &[]);
        write_rootfs_tar(&root, &ignore, &out).unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(&out).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"app/bin".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("proc")));
    }

    #[test]
    fn test_sanitize_ref() {
        assert_eq!(sanitize_ref("docker.io/library/alpine:3.19"), "docker.io_library_alpine_3.19");
        assert_eq!(sanitize_ref("img@sha256:abcd"), "img_sha256_abcd");
    }
}
