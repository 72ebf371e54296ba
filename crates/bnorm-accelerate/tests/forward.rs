mod common;

use bnorm_accelerate::{
    status_of, BnormError, BnormFwd, BnormFwdPd, FwdExecArgs, InProcessProvider, Status,
};
use bnorm_accelerate_api::{
    BatchNormDesc, DataType, KernelProvider, MemoryDesc, MemoryLayout, NormFlags, PostOp,
    PrimitiveAttr, PropKind,
};
use common::*;

const TRAINING_ORDER: [&str; 5] = [
    "bnorm_calc_mean",
    "bnorm_calc_variance",
    "bnorm_reduce_mean",
    "bnorm_reduce_variance",
    "bnorm_fwd",
];

fn affine() -> NormFlags {
    NormFlags {
        use_scale: true,
        use_shift: true,
        ..NormFlags::default()
    }
}

fn build(provider: &InProcessProvider, desc: &BatchNormDesc) -> BnormFwd {
    let pd = BnormFwdPd::init(desc, provider).unwrap();
    let mut prim = BnormFwd::new(pd);
    prim.build_kernels(provider).unwrap();
    prim
}

fn check_training(md: MemoryDesc) {
    init_logging();
    let provider = InProcessProvider::default();
    let desc = BatchNormDesc::forward(PropKind::ForwardTraining, md.clone(), affine(), EPS);
    let prim = build(&provider, &desc);

    let ic = md.channels();
    let x = Logical::random(&md, 7);
    let gamma = pseudo_random(ic, 1);
    let beta = pseudo_random(ic, 2);
    let src = upload(&provider, &md, &x);
    let dst = zeros(&provider, md.size_in_bytes() / 4);
    let mean = zeros(&provider, ic);
    let variance = zeros(&provider, ic);
    let scale = provider.upload_f32(&gamma).unwrap();
    let shift = provider.upload_f32(&beta).unwrap();
    let args = FwdExecArgs {
        mean: Some(&mean),
        variance: Some(&variance),
        scale: Some(&scale),
        shift: Some(&shift),
        ..FwdExecArgs::new(&src, &dst)
    };
    prim.execute(&provider, &args).unwrap();

    let (ref_mean, ref_var) = stats(&x);
    assert_close(&provider.download_f32(&mean).unwrap(), &ref_mean, 1e-4);
    assert_close(&provider.download_f32(&variance).unwrap(), &ref_var, 1e-3);
    let expected = reference_forward(&x, &ref_mean, &ref_var, &gamma, &beta, false);
    assert_close(&download(&provider, &md, &dst).data, &expected.data, 2e-3);
    assert_eq!(provider.launch_log(), TRAINING_ORDER);
    // Scratch is released; only the six caller buffers remain.
    assert_eq!(provider.live_buffers(), 6);
}

#[test]
fn training_plain_matches_reference() {
    check_training(MemoryDesc::new(DataType::F32, &[2, 5, 3, 3], MemoryLayout::Plain));
}

#[test]
fn training_channels_last_matches_reference() {
    check_training(MemoryDesc::new(
        DataType::F32,
        &[3, 32, 2, 3],
        MemoryLayout::ChannelsLast,
    ));
}

#[test]
fn training_blocked_matches_reference() {
    check_training(MemoryDesc::new(
        DataType::F32,
        &[2, 20, 2, 2],
        MemoryLayout::Blocked { channel_block: 16 },
    ));
}

#[test]
fn training_with_many_reduction_chunks() {
    // 2 * 300 reduction points split into 256-element chunks.
    check_training(MemoryDesc::new(DataType::F32, &[2, 3, 300], MemoryLayout::Plain));
}

#[test]
fn supplied_statistics_launch_only_the_main_kernel() {
    init_logging();
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::F32, &[2, 4, 5], MemoryLayout::Plain);
    let flags = NormFlags {
        use_global_stats: true,
        ..affine()
    };
    let desc = BatchNormDesc::forward(PropKind::ForwardInference, md.clone(), flags, EPS);
    let prim = build(&provider, &desc);
    assert_eq!(
        prim.resolved().set.names(),
        vec![Some("bnorm_fwd"), None, None, None, None]
    );

    let x = Logical::random(&md, 11);
    let (ref_mean, ref_var) = stats(&x);
    let gamma = pseudo_random(4, 3);
    let beta = pseudo_random(4, 4);
    let src = upload(&provider, &md, &x);
    let dst = zeros(&provider, md.size_in_bytes() / 4);
    let mean = provider.upload_f32(&ref_mean).unwrap();
    let variance = provider.upload_f32(&ref_var).unwrap();
    let scale = provider.upload_f32(&gamma).unwrap();
    let shift = provider.upload_f32(&beta).unwrap();
    let args = FwdExecArgs {
        mean: Some(&mean),
        variance: Some(&variance),
        scale: Some(&scale),
        shift: Some(&shift),
        ..FwdExecArgs::new(&src, &dst)
    };
    prim.execute(&provider, &args).unwrap();

    assert_eq!(provider.launch_log(), vec!["bnorm_fwd"]);
    let expected = reference_forward(&x, &ref_mean, &ref_var, &gamma, &beta, false);
    assert_close(&download(&provider, &md, &dst).data, &expected.data, 1e-4);
}

#[test]
fn inference_with_computed_statistics_uses_scratch() {
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::F32, &[2, 16, 3], MemoryLayout::ChannelsLast);
    let desc = BatchNormDesc::forward(
        PropKind::ForwardInference,
        md.clone(),
        NormFlags::default(),
        EPS,
    );
    let prim = build(&provider, &desc);
    let x = Logical::random(&md, 5);
    let src = upload(&provider, &md, &x);
    let dst = zeros(&provider, md.size_in_bytes() / 4);
    prim.execute(&provider, &FwdExecArgs::new(&src, &dst)).unwrap();

    let (ref_mean, ref_var) = stats(&x);
    let ones = vec![1.0; 16];
    let no_shift = vec![0.0; 16];
    let expected = reference_forward(&x, &ref_mean, &ref_var, &ones, &no_shift, false);
    assert_close(&download(&provider, &md, &dst).data, &expected.data, 2e-3);
    assert_eq!(provider.launch_log(), TRAINING_ORDER);
    assert_eq!(provider.live_buffers(), 2);
}

#[test]
fn relu_post_op_clamps_output() {
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::F32, &[2, 3, 4], MemoryLayout::Plain);
    let desc = BatchNormDesc::forward(PropKind::ForwardTraining, md.clone(), NormFlags::default(), EPS)
        .with_attr(PrimitiveAttr::default().with_post_op(PostOp::relu(0.0)));
    let prim = build(&provider, &desc);
    assert!(prim.pd().workspace().is_none());

    let x = Logical::random(&md, 9);
    let src = upload(&provider, &md, &x);
    let dst = zeros(&provider, md.size_in_bytes() / 4);
    let mean = zeros(&provider, 3);
    let variance = zeros(&provider, 3);
    let args = FwdExecArgs {
        mean: Some(&mean),
        variance: Some(&variance),
        ..FwdExecArgs::new(&src, &dst)
    };
    prim.execute(&provider, &args).unwrap();

    let (ref_mean, ref_var) = stats(&x);
    let expected = reference_forward(&x, &ref_mean, &ref_var, &[1.0; 3], &[0.0; 3], true);
    assert_close(&download(&provider, &md, &dst).data, &expected.data, 2e-3);
}

#[test]
fn norm_add_relu_writes_activation_mask() {
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::F32, &[2, 5, 3], MemoryLayout::Plain);
    let flags = NormFlags {
        fuse_norm_add_relu: true,
        ..affine()
    };
    let desc = BatchNormDesc::forward(PropKind::ForwardTraining, md.clone(), flags, EPS);
    let prim = build(&provider, &desc);
    let ws_desc = prim.pd().workspace().cloned().unwrap();
    assert_eq!(ws_desc.bytes, 2 * 5 * 3);

    let x = Logical::random(&md, 21);
    let add = Logical::random(&md, 22);
    let gamma = pseudo_random(5, 23);
    let beta = pseudo_random(5, 24);
    let src = upload(&provider, &md, &x);
    let src_add = upload(&provider, &md, &add);
    let dst = zeros(&provider, md.size_in_bytes() / 4);
    let mean = zeros(&provider, 5);
    let variance = zeros(&provider, 5);
    let scale = provider.upload_f32(&gamma).unwrap();
    let shift = provider.upload_f32(&beta).unwrap();
    let ws = provider.alloc(ws_desc.bytes).unwrap();
    let args = FwdExecArgs {
        mean: Some(&mean),
        variance: Some(&variance),
        scale: Some(&scale),
        shift: Some(&shift),
        src_add: Some(&src_add),
        workspace: Some(&ws),
        ..FwdExecArgs::new(&src, &dst)
    };
    prim.execute(&provider, &args).unwrap();

    let (ref_mean, ref_var) = stats(&x);
    let normed = reference_forward(&x, &ref_mean, &ref_var, &gamma, &beta, false);
    let summed: Vec<f32> = normed.data.iter().zip(&add.data).map(|(a, b)| a + b).collect();
    let expected: Vec<f32> = summed.iter().map(|v| v.max(0.0)).collect();
    let got = download(&provider, &md, &dst);
    assert_close(&got.data, &expected, 2e-3);

    // Plain layout without channel padding: the mask is in logical order.
    let mask = provider.download_bytes(&ws).unwrap();
    for (i, v) in summed.iter().enumerate() {
        if v.abs() > 1e-3 {
            assert_eq!(mask[i], u8::from(*v > 0.0), "mask element {i}");
        }
    }
}

#[test]
fn fused_training_requires_workspace_buffer() {
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::F32, &[2, 4, 3], MemoryLayout::Plain);
    let flags = NormFlags {
        fuse_norm_relu: true,
        ..NormFlags::default()
    };
    let desc = BatchNormDesc::forward(PropKind::ForwardTraining, md.clone(), flags, EPS);
    let prim = build(&provider, &desc);
    let src = zeros(&provider, 24);
    let dst = zeros(&provider, 24);
    let mean = zeros(&provider, 4);
    let variance = zeros(&provider, 4);
    let args = FwdExecArgs {
        mean: Some(&mean),
        variance: Some(&variance),
        ..FwdExecArgs::new(&src, &dst)
    };
    let err = prim.execute(&provider, &args).unwrap_err();
    assert!(matches!(err, BnormError::InvalidArguments(_)));
    assert!(provider.launch_log().is_empty());
}

#[test]
fn channel_count_changes_runtime_record_only() {
    init_logging();
    let provider = InProcessProvider::default();
    let pds: Vec<BnormFwdPd> = [32usize, 64]
        .into_iter()
        .map(|ic| {
            let md = MemoryDesc::new(DataType::F32, &[2, ic, 4, 4], MemoryLayout::ChannelsLast);
            let desc = BatchNormDesc::forward(PropKind::ForwardTraining, md, affine(), EPS);
            BnormFwdPd::init(&desc, &provider).unwrap()
        })
        .collect();
    assert_eq!(pds[0].conf(), pds[1].conf());
    assert_ne!(pds[0].rt_conf(), pds[1].rt_conf());

    let mut prims: Vec<BnormFwd> = pds.into_iter().map(BnormFwd::new).collect();
    for prim in &mut prims {
        prim.build_kernels(&provider).unwrap();
    }
    let expected = vec![
        Some("bnorm_fwd"),
        Some("bnorm_calc_mean"),
        Some("bnorm_calc_variance"),
        Some("bnorm_reduce_mean"),
        Some("bnorm_reduce_variance"),
    ];
    assert_eq!(prims[0].resolved().set.names(), expected);
    assert_eq!(prims[1].resolved().set.names(), expected);
    assert_eq!(prims[0].resolved().key, prims[1].resolved().key);

    let telemetry = provider.telemetry();
    assert_eq!(telemetry.kernel_builds, 1);
    assert_eq!(telemetry.kernel_cache_misses, 1);
    assert_eq!(telemetry.kernel_cache_hits, 1);
    assert_eq!(provider.cached_kernel_sets(), 1);

    let a = prims[0].kernels().unwrap();
    let b = prims[1].kernels().unwrap();
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x.as_ref().unwrap(), y.as_ref().unwrap());
        assert!(std::ptr::eq(
            std::sync::Arc::as_ptr(x) as *const (),
            std::sync::Arc::as_ptr(y) as *const ()
        ));
    }
}

#[test]
fn zero_sized_operand_is_a_no_op() {
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::F32, &[0, 4, 3], MemoryLayout::Plain);
    let desc = BatchNormDesc::forward(PropKind::ForwardTraining, md, affine(), EPS);
    let pd = BnormFwdPd::init(&desc, &provider).unwrap();
    assert!(pd.has_zero_dim_memory());
    let mut prim = BnormFwd::new(pd);
    prim.build_kernels(&provider).unwrap();
    assert!(prim.kernels().is_none());

    let empty = provider.alloc(0).unwrap();
    prim.execute(&provider, &FwdExecArgs::new(&empty, &empty))
        .unwrap();
    assert!(provider.launch_log().is_empty());
    let telemetry = provider.telemetry();
    assert_eq!(telemetry.submissions, 0);
    assert_eq!(telemetry.kernel_builds, 0);
}

#[test]
fn s8_training_is_unsupported() {
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::S8, &[2, 16, 4, 4], MemoryLayout::ChannelsLast);
    let desc = BatchNormDesc::forward(PropKind::ForwardTraining, md, NormFlags::default(), EPS);
    let result = BnormFwdPd::init(&desc, &provider);
    assert!(matches!(result, Err(BnormError::Unsupported(_))));
    assert_eq!(status_of(&result), Status::Unimplemented);
    assert_eq!(provider.live_buffers(), 0);
}

#[test]
fn s8_inference_builds_but_host_refuses_to_run() {
    let provider = InProcessProvider::default();
    let md = MemoryDesc::new(DataType::S8, &[1, 8, 2], MemoryLayout::Plain);
    let flags = NormFlags {
        use_global_stats: true,
        ..NormFlags::default()
    };
    let desc = BatchNormDesc::forward(PropKind::ForwardInference, md, flags, EPS);
    let prim = build(&provider, &desc);
    let src = provider.alloc(16).unwrap();
    let dst = provider.alloc(16).unwrap();
    let mean = zeros(&provider, 8);
    let variance = zeros(&provider, 8);
    let args = FwdExecArgs {
        mean: Some(&mean),
        variance: Some(&variance),
        ..FwdExecArgs::new(&src, &dst)
    };
    let err = prim.execute(&provider, &args).unwrap_err();
    assert!(matches!(err, BnormError::Device(_)));
    assert_eq!(err.status(), Status::RuntimeError);
}

#[test]
fn device_info_is_reported() {
    let provider = InProcessProvider::default();
    assert!(!provider.device_info().is_empty());
}
