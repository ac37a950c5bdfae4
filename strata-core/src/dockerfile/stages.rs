//! Stage resolution: the planner.
//!
//! Takes a parsed Dockerfile and produces the ordered list of stages the
//! orchestrator executes: meta-args expanded, stage bases resolved, the
//! target selected, unused stages pruned, base `ONBUILD` triggers unfolded,
//! single-consumer stages squashed, and cross-stage `COPY --from`
//! references rewritten to the compacted indices.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{BuildOptions, FeatureFlags};
use crate::dockerfile::expand::{expand_at_line, ExpansionEnv};
use crate::dockerfile::parser::{self, ArgDecl, Dockerfile, Instruction, InstructionKind, Stage};
use crate::error::{ParseError, Result, StrataError};

/// The base image reference `FROM scratch` resolves to.
pub const NO_BASE_IMAGE: &str = "scratch";

/// A stage as the orchestrator executes it.
#[derive(Debug, Clone)]
pub struct ResolvedStage {
    pub stage: Stage,
    /// Index of the local base stage in the *compacted* stage list, if the
    /// base is a previous stage.
    pub base_image_index: Option<usize>,
    /// Whether a later surviving stage needs this stage's filesystem
    /// (either as a base or through `COPY --from`).
    pub save_stage: bool,
    /// Whether this is the target stage.
    pub final_stage: bool,
    /// The stage's index in the original Dockerfile.
    pub original_index: usize,
}

impl ResolvedStage {
    pub fn base_is_scratch(&self) -> bool {
        self.base_image_index.is_none() && self.stage.base_name.eq_ignore_ascii_case(NO_BASE_IMAGE)
    }
}

/// The planner's output.
#[derive(Debug, Clone)]
pub struct Plan {
    pub stages: Vec<ResolvedStage>,
    /// Effective meta-args (expanded, command-line overrides applied).
    pub meta_args: Vec<ArgDecl>,
}

/// Source of `ONBUILD` triggers for remote base images.
///
/// The orchestrator provides a registry-backed implementation; dry runs and
/// tests use [`NoRemoteBase`] so planning never touches the network.
#[async_trait]
pub trait BaseConfigSource: Send + Sync {
    async fn onbuild_triggers(&self, image: &str) -> Result<Vec<String>>;
}

/// A [`BaseConfigSource`] that reports no triggers for any image.
pub struct NoRemoteBase;

#[async_trait]
impl BaseConfigSource for NoRemoteBase {
    async fn onbuild_triggers(&self, _image: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Resolve a parsed Dockerfile into the executable stage plan.
pub async fn plan(
    dockerfile: Dockerfile,
    opts: &BuildOptions,
    flags: &FeatureFlags,
    base_source: &dyn BaseConfigSource,
) -> Result<Plan> {
    let Dockerfile { mut stages, meta_args } = dockerfile;

    let meta_args = strip_enclosing_quotes(meta_args)?;
    let meta_args = expand_nested_meta_args(meta_args, opts)?;
    resolve_stage_bases(&mut stages, &meta_args, opts)?;

    let target = target_stage(&stages, opts.target.as_deref())?;
    stages.truncate(target + 1);

    let stage_by_name: BTreeMap<String, usize> = stages
        .iter()
        .enumerate()
        .filter_map(|(idx, s)| s.name.clone().map(|n| (n, idx)))
        .collect();

    // Reference counting: stage_refs[i] counts later stages based on stage
    // i, copy_refs[i] counts `COPY --from` references to it. The target is
    // seeded so it always survives.
    let mut stage_refs = vec![0usize; stages.len()];
    let mut copy_refs = vec![0usize; stages.len()];
    stage_refs[target] = 1;

    let mut resolved: Vec<Option<ResolvedStage>> = (0..stages.len()).map(|_| None).collect();

    for i in (0..=target).rev() {
        if stage_refs[i] == 0 && copy_refs[i] == 0 && opts.skip_unused_stages {
            debug!(stage = i, "skipping unused stage");
            continue;
        }
        let mut stage = stages[i].clone();
        if let Some(name) = &stage.name {
            info!("resolved base name of {} to {}", name, stage.base_name);
        }
        let base_image_index = base_image_index(i, &stages);

        // Unfold the base image's ONBUILD triggers into this stage.
        let triggers = if stage.base_name.eq_ignore_ascii_case(NO_BASE_IMAGE) {
            Vec::new()
        } else if let Some(base_idx) = base_image_index {
            onbuild_expressions(&stages[base_idx].instructions)
        } else {
            base_source.onbuild_triggers(&stage.base_name).await?
        };
        if !triggers.is_empty() {
            let triggered = parser::parse_commands(&triggers).map_err(|e| {
                StrataError::InvalidDockerfile {
                    path: opts.dockerfile_path.clone().into(),
                    source: ParseError::new(stage.line, format!("invalid ONBUILD trigger: {e}")),
                }
            })?;
            let mut merged = triggered;
            merged.append(&mut stage.instructions);
            stage.instructions = merged;
        }

        if let Some(base_idx) = base_image_index {
            stage_refs[base_idx] += 1;
        }
        for inst in &stage.instructions {
            if let Some(from) = copy_from_of(inst) {
                if let Ok(idx) = from.parse::<usize>() {
                    if idx < stages.len() {
                        copy_refs[idx] += 1;
                        continue;
                    }
                }
                if let Some(&idx) = stage_by_name.get(&from.to_lowercase()) {
                    copy_refs[idx] += 1;
                }
                // Anything else falls through to a remote image reference.
            }
        }

        resolved[i] = Some(ResolvedStage {
            stage,
            base_image_index,
            save_stage: false,
            final_stage: i == target,
            original_index: i,
        });
    }

    // Squash single-consumer local bases into their consumer. One pass, not
    // transitive: a chain only collapses by one link per build.
    if opts.skip_unused_stages && flags.squash_stages {
        for i in 0..resolved.len() {
            if stage_refs[i] == 0 {
                continue;
            }
            let Some(current) = &resolved[i] else { continue };
            let Some(base_idx) = current.base_image_index else { continue };
            if stage_refs[base_idx] == 1 && copy_refs[base_idx] == 0 {
                let Some(base) = resolved[base_idx].take() else { continue };
                let current = resolved[i].take().expect("checked above");
                info!(
                    "squashing stage {} into {}",
                    display_name(&base.stage, base_idx),
                    display_name(&current.stage, i)
                );
                resolved[i] = Some(squash(base, current));
                stage_refs[base_idx] = 0;
            }
        }
    }

    // Compact: drop dead stages, rewrite indices.
    let mut old_to_new = BTreeMap::new();
    let mut surviving = Vec::new();
    for (i, slot) in resolved.into_iter().enumerate() {
        if stage_refs[i] > 0 || copy_refs[i] > 0 {
            if let Some(mut stage) = slot {
                stage.save_stage = copy_refs[i] > 0 || (stage_refs[i] > 0 && !stage.final_stage);
                old_to_new.insert(i, surviving.len());
                surviving.push(stage);
            }
        }
    }
    for stage in &mut surviving {
        stage.base_image_index = stage.base_image_index.map(|old| {
            *old_to_new.get(&old).expect("base of surviving stage must survive")
        });
        rewrite_copy_from(&mut stage.stage.instructions, &stage_by_name, &old_to_new);
    }

    Ok(Plan { stages: surviving, meta_args })
}

fn display_name(stage: &Stage, index: usize) -> String {
    stage.name.clone().unwrap_or_else(|| index.to_string())
}

/// Index of the earlier stage this stage is based on, if any.
/// Comparison is case-insensitive; only strictly-earlier stages match.
fn base_image_index(current: usize, stages: &[Stage]) -> Option<usize> {
    let base = stages[current].base_name.to_lowercase();
    stages[..current]
        .iter()
        .position(|s| s.name.as_deref() == Some(base.as_str()))
}

/// Index of the target stage: `--target` by case-insensitive name or
/// numeric index, the last stage by default.
fn target_stage(stages: &[Stage], target: Option<&str>) -> Result<usize> {
    match target {
        None | Some("") => Ok(stages.len() - 1),
        Some(t) => {
            if let Some(idx) = stages
                .iter()
                .position(|s| s.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(t)))
            {
                return Ok(idx);
            }
            if let Ok(idx) = t.parse::<usize>() {
                if idx < stages.len() {
                    return Ok(idx);
                }
            }
            Err(StrataError::UnknownTarget { target: t.to_string() })
        }
    }
}

/// Remove quotes enclosing each meta-arg value. Escaped quotes stay as
/// given; an unmatched leading or trailing quote is an error.
fn strip_enclosing_quotes(meta_args: Vec<ArgDecl>) -> Result<Vec<ArgDecl>> {
    meta_args
        .into_iter()
        .map(|mut arg| {
            if let Some(value) = arg.value.take() {
                arg.value = Some(extract_val_from_quotes(&value, arg.line)?);
            }
            Ok(arg)
        })
        .collect()
}

fn extract_val_from_quotes(val: &str, line: usize) -> Result<String> {
    let bytes = val.as_bytes();
    if bytes.len() < 2 {
        return Ok(val.to_string());
    }

    let leader: &str = match bytes[0] {
        b'\'' | b'"' => &val[..1],
        b'\\' if matches!(bytes[1], b'\'' | b'"') => &val[..2],
        _ => "",
    };
    let tail: &str = if leader.len() < 2 {
        match bytes[bytes.len() - 1] {
            b'\'' | b'"' => &val[val.len() - 1..],
            _ => "",
        }
    } else {
        match &val[val.len().saturating_sub(2)..] {
            t @ ("\\'" | "\\\"") => t,
            _ => "",
        }
    };

    if leader != tail {
        return Err(StrataError::InvalidDockerfile {
            path: "Dockerfile".into(),
            source: ParseError::new(line, "quotes wrapping arg values must be matched"),
        });
    }
    if leader.is_empty() || leader.len() == 2 {
        return Ok(val.to_string());
    }
    Ok(val[1..val.len() - 1].to_string())
}

/// Resolve nested meta-arg values against previously declared meta-args
/// and command-line overrides, producing the effective meta-arg set.
fn expand_nested_meta_args(meta_args: Vec<ArgDecl>, opts: &BuildOptions) -> Result<Vec<ArgDecl>> {
    let overrides = cli_arg_map(&opts.build_args);
    let mut prev: BTreeMap<String, String> = BTreeMap::new();
    let mut out = Vec::with_capacity(meta_args.len());

    for mut arg in meta_args {
        if let Some(value) = arg.value.take() {
            let env = ExpansionEnv::new().push(&prev).push(&overrides);
            let mut used = BTreeMap::new();
            let expanded = expand_at_line(&value, &env, &mut used, arg.line).map_err(|e| {
                StrataError::ArgResolution { name: arg.name.clone(), reason: e.to_string() }
            })?;
            arg.value = Some(expanded);
        }
        let effective = overrides.get(&arg.name).cloned().or_else(|| arg.value.clone());
        if let Some(v) = effective {
            prev.insert(arg.name.clone(), v);
        }
        out.push(arg);
    }
    Ok(out)
}

/// Substitute meta-args into every stage's base reference.
fn resolve_stage_bases(
    stages: &mut [Stage],
    meta_args: &[ArgDecl],
    opts: &BuildOptions,
) -> Result<()> {
    let overrides = cli_arg_map(&opts.build_args);
    let mut unified: BTreeMap<String, String> = meta_args
        .iter()
        .filter_map(|a| a.value.clone().map(|v| (a.name.clone(), v)))
        .collect();
    unified.extend(overrides);

    for stage in stages.iter_mut() {
        let env = ExpansionEnv::new().push(&unified);
        let mut used = BTreeMap::new();
        let resolved = expand_base(&stage.base_name, &env, &mut used, stage.line)?;
        if resolved != stage.base_name {
            debug!(from = %stage.base_name, to = %resolved, "resolved stage base");
            stage.base_name = resolved;
        }
    }
    Ok(())
}

fn expand_base(
    base: &str,
    env: &ExpansionEnv<'_>,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<String> {
    crate::dockerfile::expand::expand_at_line(base, env, used, line).map_err(|e| {
        StrataError::ArgResolution { name: base.to_string(), reason: e.to_string() }
    })
}

fn cli_arg_map(args: &[String]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for arg in args {
        if let Some((k, v)) = arg.split_once('=') {
            if !v.is_empty() {
                map.insert(k.to_string(), v.to_string());
            }
        }
    }
    map
}

/// The ONBUILD declaration expressions of a stage, in order.
fn onbuild_expressions(instructions: &[Instruction]) -> Vec<String> {
    instructions
        .iter()
        .filter_map(|inst| match &inst.kind {
            InstructionKind::Onbuild { expression } => Some(expression.clone()),
            _ => None,
        })
        .collect()
}

fn copy_from_of(inst: &Instruction) -> Option<String> {
    match &inst.kind {
        InstructionKind::Copy(spec) => spec.from.clone(),
        InstructionKind::Add(spec) => spec.from.clone(),
        _ => None,
    }
}

/// Merge a single-consumer base stage into its consumer. The base's
/// ONBUILD declarations are dropped (their triggers were already unfolded
/// into the consumer); everything else runs before the consumer's own
/// instructions.
fn squash(base: ResolvedStage, current: ResolvedStage) -> ResolvedStage {
    let mut instructions: Vec<Instruction> = base
        .stage
        .instructions
        .into_iter()
        .filter(|inst| !matches!(inst.kind, InstructionKind::Onbuild { .. }))
        .collect();
    instructions.extend(current.stage.instructions);

    ResolvedStage {
        stage: Stage {
            name: current.stage.name,
            base_name: base.stage.base_name,
            platform: base.stage.platform,
            instructions,
            line: base.stage.line,
            raw_from: base.stage.raw_from,
        },
        base_image_index: base.base_image_index,
        save_stage: current.save_stage,
        final_stage: current.final_stage,
        original_index: current.original_index,
    }
}

/// Rewrite `COPY --from` references to the compacted stage indices.
/// Unknown names are left as-is and resolve to remote images at run time.
fn rewrite_copy_from(
    instructions: &mut [Instruction],
    stage_by_name: &BTreeMap<String, usize>,
    old_to_new: &BTreeMap<usize, usize>,
) {
    for inst in instructions {
        let from = match &mut inst.kind {
            InstructionKind::Copy(spec) => &mut spec.from,
            InstructionKind::Add(spec) => &mut spec.from,
            _ => continue,
        };
        let Some(reference) = from.as_deref() else { continue };

        let old_index = match reference.parse::<usize>() {
            Ok(idx) => Some(idx),
            Err(_) => stage_by_name.get(&reference.to_lowercase()).copied(),
        };
        match old_index.and_then(|old| old_to_new.get(&old)) {
            Some(new) => *from = Some(new.to_string()),
            None if old_index.is_none() => {
                warn!(
                    reference,
                    "COPY --from does not name a stage; treating it as an image reference"
                );
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::parser::parse;

    fn plan_sync(content: &str, opts: &BuildOptions, flags: &FeatureFlags) -> Result<Plan> {
        let dockerfile = parse(content).map_err(|e| StrataError::InvalidDockerfile {
            path: "Dockerfile".into(),
            source: e,
        })?;
        tokio::runtime::Runtime::new()
            .expect("runtime")
            .block_on(plan(dockerfile, opts, flags, &NoRemoteBase))
    }

    fn default_opts() -> BuildOptions {
        BuildOptions::default()
    }

    #[test]
    fn test_single_stage_plan() {
        let plan = plan_sync(
            "FROM alpine:3.19\nRUN echo hi\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert!(plan.stages[0].final_stage);
        assert!(!plan.stages[0].save_stage);
    }

    #[test]
    fn test_unused_stage_pruned() {
        let plan = plan_sync(
            "FROM alpine AS unused\nRUN echo no\n\nFROM debian\nRUN echo yes\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].stage.base_name, "debian");
    }

    #[test]
    fn test_numeric_copy_from_keeps_stage_alive() {
        // Stage 0 is only referenced numerically; it must survive pruning.
        let plan = plan_sync(
            "FROM busybox AS a\nRUN touch /a\n\nFROM busybox AS b\nRUN touch /b\n\nFROM scratch\nCOPY --from=0 / /\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[0].stage.name.as_deref(), Some("a"));
        assert!(plan.stages[0].save_stage);
        assert!(plan.stages[1].final_stage);
    }

    #[test]
    fn test_stage_ref_invariant_after_pruning() {
        let plan = plan_sync(
            "FROM alpine AS base\nRUN echo base\n\nFROM base AS mid\nRUN echo mid\n\nFROM alpine AS dead\nRUN echo dead\n\nFROM scratch\nCOPY --from=mid /x /x\n",
            &default_opts(),
            &FeatureFlags { squash_stages: false, ..Default::default() },
        )
        .unwrap();
        // dead is pruned; base, mid and the final stage survive and every
        // non-final survivor is referenced.
        assert_eq!(plan.stages.len(), 3);
        for stage in &plan.stages {
            assert!(stage.final_stage || stage.save_stage);
        }
    }

    #[test]
    fn test_squash_single_consumer() {
        let content = "FROM scratch AS base\nCOPY a /a\n\nFROM base\nCOPY b /b\n";
        let squashed = plan_sync(&content, &default_opts(), &FeatureFlags::default()).unwrap();
        assert_eq!(squashed.stages.len(), 1);
        assert_eq!(squashed.stages[0].stage.instructions.len(), 2);
        assert!(squashed.stages[0].final_stage);
        assert_eq!(squashed.stages[0].stage.base_name, "scratch");

        let unsquashed = plan_sync(
            &content,
            &default_opts(),
            &FeatureFlags { squash_stages: false, ..Default::default() },
        )
        .unwrap();
        assert_eq!(unsquashed.stages.len(), 2);
        assert!(unsquashed.stages[0].save_stage);
    }

    #[test]
    fn test_squash_skipped_when_copy_referenced() {
        // base is both a parent and a COPY --from source: not squashable.
        let plan = plan_sync(
            "FROM alpine AS base\nRUN touch /x\n\nFROM base\nCOPY --from=base /x /y\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 2);
    }

    #[test]
    fn test_squash_not_transitive() {
        let plan = plan_sync(
            "FROM scratch AS a\nCOPY 1 /1\n\nFROM a AS b\nCOPY 2 /2\n\nFROM b\nCOPY 3 /3\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        // One squash link collapses per pass: b into the final stage, a
        // survives on its own.
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[1].stage.instructions.len(), 2);
    }

    #[test]
    fn test_target_selection() {
        let content = "FROM alpine AS dev\nRUN echo dev\n\nFROM alpine AS prod\nRUN echo prod\n";
        let plan = plan_sync(
            content,
            &BuildOptions { target: Some("DEV".into()), ..Default::default() },
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].stage.name.as_deref(), Some("dev"));

        let err = plan_sync(
            content,
            &BuildOptions { target: Some("nope".into()), ..Default::default() },
            &FeatureFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::UnknownTarget { .. }));
    }

    #[test]
    fn test_meta_arg_expansion_in_from() {
        let plan = plan_sync(
            "ARG TAG=3.19\nARG IMAGE=alpine:${TAG}\nFROM ${IMAGE}\nRUN echo hi\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages[0].stage.base_name, "alpine:3.19");
    }

    #[test]
    fn test_meta_arg_cli_override() {
        let plan = plan_sync(
            "ARG TAG=3.19\nFROM alpine:${TAG}\nRUN echo hi\n",
            &BuildOptions { build_args: vec!["TAG=edge".into()], ..Default::default() },
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages[0].stage.base_name, "alpine:edge");
    }

    #[test]
    fn test_quote_stripping() {
        assert_eq!(extract_val_from_quotes("\"x\"", 1).unwrap(), "x");
        assert_eq!(extract_val_from_quotes("'x'", 1).unwrap(), "x");
        assert_eq!(extract_val_from_quotes("\\\"x\\\"", 1).unwrap(), "\\\"x\\\"");
        assert_eq!(extract_val_from_quotes("plain", 1).unwrap(), "plain");
        assert!(extract_val_from_quotes("\"x", 1).is_err());
        assert!(extract_val_from_quotes("x\"", 1).is_err());
    }

    #[test]
    fn test_onbuild_unfolded_from_local_base() {
        let plan = plan_sync(
            "FROM alpine AS base\nONBUILD RUN echo fired\n\nFROM base\nRUN echo own\n",
            &default_opts(),
            &FeatureFlags { squash_stages: false, ..Default::default() },
        )
        .unwrap();
        let last = plan.stages.last().unwrap();
        assert_eq!(last.stage.instructions.len(), 2);
        assert!(matches!(last.stage.instructions[0].kind, InstructionKind::Run(_)));
        assert_eq!(last.stage.instructions[0].raw, "RUN echo fired");
    }

    #[test]
    fn test_copy_from_rewritten_after_compaction() {
        let plan = plan_sync(
            "FROM alpine AS junk\nRUN echo junk\n\nFROM alpine AS keep\nRUN touch /k\n\nFROM scratch\nCOPY --from=keep /k /k\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 2);
        let copy = &plan.stages[1].stage.instructions[0];
        match &copy.kind {
            InstructionKind::Copy(spec) => assert_eq!(spec.from.as_deref(), Some("0")),
            other => panic!("expected COPY, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_copy_from_is_external() {
        let plan = plan_sync(
            "FROM scratch\nCOPY --from=debian:bookworm /etc/os-release /\n",
            &default_opts(),
            &FeatureFlags::default(),
        )
        .unwrap();
        let copy = &plan.stages[0].stage.instructions[0];
        match &copy.kind {
            InstructionKind::Copy(spec) => {
                assert_eq!(spec.from.as_deref(), Some("debian:bookworm"))
            }
            other => panic!("expected COPY, got {other:?}"),
        }
    }
}
