use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use bnorm_accelerate::cache::compute_kernel_set_hash;
use bnorm_accelerate::{
    BnormBwdPd, BnormFwdPd, BnormRuntimeParams, InProcessOptions, InProcessProvider, KernelSet,
};
use bnorm_accelerate_api::{
    BatchNormDesc, DataType, MemoryDesc, MemoryLayout, NormFlags, PostOp, PrimitiveAttr, PropKind,
};
use serde::Serialize;

const USAGE: &str = "usage: bnorm_plan [--dtype f32|bf16|f16|s8] [--dims N,C,...] \
[--layout plain|nhwc|blocked:B] [--training] [--global-stats] [--relu] [--backward]";

#[derive(Debug)]
struct PlanArgs {
    dtype: DataType,
    dims: Vec<usize>,
    layout: MemoryLayout,
    training: bool,
    global_stats: bool,
    relu: bool,
    backward: bool,
}

impl Default for PlanArgs {
    fn default() -> Self {
        Self {
            dtype: DataType::F32,
            dims: vec![2, 32, 8, 8],
            layout: MemoryLayout::Plain,
            training: false,
            global_stats: false,
            relu: false,
            backward: false,
        }
    }
}

#[derive(Serialize)]
struct Plan {
    direction: &'static str,
    kernels: KernelSet,
    key_fingerprint: String,
    key_bytes: usize,
    workspace_bytes: Option<usize>,
    scratch_bytes: usize,
    runtime: BnormRuntimeParams,
}

fn parse_dtype(raw: &str) -> Result<DataType> {
    Ok(match raw {
        "f32" => DataType::F32,
        "bf16" => DataType::Bf16,
        "f16" => DataType::F16,
        "s8" => DataType::S8,
        "u8" => DataType::U8,
        other => bail!("unknown data type {other:?}"),
    })
}

fn parse_layout(raw: &str) -> Result<MemoryLayout> {
    match raw {
        "plain" | "nchw" => Ok(MemoryLayout::Plain),
        "nhwc" | "channels-last" => Ok(MemoryLayout::ChannelsLast),
        other => {
            let block = other
                .strip_prefix("blocked:")
                .ok_or_else(|| anyhow!("unknown layout {other:?}"))?;
            let channel_block = block
                .parse::<u32>()
                .with_context(|| format!("invalid channel block {block:?}"))?;
            Ok(MemoryLayout::Blocked { channel_block })
        }
    }
}

fn parse_dims(raw: &str) -> Result<Vec<usize>> {
    raw.split(',')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .with_context(|| format!("invalid dimension {d:?}"))
        })
        .collect()
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<PlanArgs> {
    let mut parsed = PlanArgs::default();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| anyhow!("{flag} expects a value"));
        match arg.as_str() {
            "--dtype" => parsed.dtype = parse_dtype(&value("--dtype")?)?,
            "--dims" => parsed.dims = parse_dims(&value("--dims")?)?,
            "--layout" => parsed.layout = parse_layout(&value("--layout")?)?,
            "--training" => parsed.training = true,
            "--global-stats" => parsed.global_stats = true,
            "--relu" => parsed.relu = true,
            "--backward" => parsed.backward = true,
            "-h" | "--help" => bail!("{USAGE}"),
            other => bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }
    Ok(parsed)
}

fn plan(args: &PlanArgs) -> Result<Plan> {
    let provider = InProcessProvider::new(InProcessOptions::default());
    let src = MemoryDesc::new(args.dtype, &args.dims, args.layout);
    let flags = NormFlags {
        use_scale: true,
        use_shift: true,
        use_global_stats: args.global_stats,
        ..NormFlags::default()
    };
    let prop_kind = if args.training {
        PropKind::ForwardTraining
    } else {
        PropKind::ForwardInference
    };
    let mut fwd_desc = BatchNormDesc::forward(prop_kind, src.clone(), flags, 1e-5);
    if args.relu {
        fwd_desc = fwd_desc.with_attr(PrimitiveAttr::default().with_post_op(PostOp::relu(0.0)));
    }
    let fwd = BnormFwdPd::init(&fwd_desc, &provider)?;

    let (direction, conf, rt, workspace_bytes, scratch_bytes) = if args.backward {
        let bwd_desc = BatchNormDesc::backward(src, flags, 1e-5);
        let bwd = BnormBwdPd::init(&bwd_desc, Some(&fwd), &provider)?;
        (
            "backward",
            *bwd.conf(),
            *bwd.rt_conf(),
            bwd.workspace().map(|ws| ws.bytes),
            bwd.scratchpad().total_bytes(),
        )
    } else {
        (
            "forward",
            *fwd.conf(),
            *fwd.rt_conf(),
            fwd.workspace().map(|ws| ws.bytes),
            fwd.scratchpad().total_bytes(),
        )
    };

    let resolved = bnorm_accelerate::resolve(&conf);
    let names = resolved.set.names();
    let fingerprint = compute_kernel_set_hash(resolved.key.as_bytes(), &names);
    Ok(Plan {
        direction,
        kernels: resolved.set.clone(),
        key_fingerprint: format!("{fingerprint:016x}"),
        key_bytes: resolved.key.as_bytes().len(),
        workspace_bytes,
        scratch_bytes,
        runtime: rt,
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let result = parse_args(std::env::args().skip(1))
        .and_then(|args| plan(&args))
        .and_then(|plan| serde_json::to_string_pretty(&plan).map_err(Into::into));
    match result {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("bnorm_plan: {err:#}");
            ExitCode::FAILURE
        }
    }
}
