//! 整条流水线的场景测试: 用假工具代替外部程序, 检查检查点, 命名和失败隔离.

mod support;

use dwi_berry::dataset::{discover, DerivativeProbe, RawDwiProbe, SessionFilter};
use dwi_berry::naming::DerivativeTree;
use dwi_berry::pipeline::atlas::{self, find_template, AtlasOptions};
use dwi_berry::pipeline::dwi::{self, DtiOptions, DtiVariant};
use dwi_berry::pipeline::{BatchReport, PipelineRunner, SessionStatus};
use dwi_berry::prelude::*;
use dwi_berry::roi;
use std::fs;
use std::path::Path;
use support::ScriptedTools;

fn run_dti(root: &Path, variant: DtiVariant, tools: &ScriptedTools) -> BatchReport {
    let cfg = PipelineConfig::default();
    let tb = Toolbox::new(&cfg, None);
    let tree = DerivativeTree::new(root, variant.default_deriv_name()).unwrap();
    let probe = RawDwiProbe::new(root, &cfg.phase_encoding);
    let discovery = discover(&probe, "9116", &SessionFilter::All).unwrap();
    let mut opts = DtiOptions::new(variant);
    opts.skip_review = true;
    PipelineRunner::new(tools)
        .run_batch("9116", discovery, |s| dwi::plan(&tb, &tree, s, &opts))
        .unwrap()
}

fn outcomes(report: &BatchReport, session: &str) -> Vec<&'static str> {
    report
        .session(session)
        .unwrap()
        .stages
        .iter()
        .map(|s| s.outcome)
        .collect()
}

#[test]
fn t1_space_session_completes_then_skips() {
    let root = tempfile::tempdir().unwrap();
    support::raw_session(root.path(), "9116", "Day14", &[]);

    let tools = ScriptedTools::new();
    let first = run_dti(root.path(), DtiVariant::T1Space, &tools);
    assert_eq!(first.exit_code(), 0);
    assert!(matches!(
        first.session("Day14").unwrap().status,
        SessionStatus::Success
    ));
    assert!(outcomes(&first, "Day14").iter().all(|o| *o == "completed"));

    let dwi_dir = root
        .path()
        .join("derivatives/pdti2/sub-9116/ses-Day14/dwi");
    for metric in DTI_METRICS {
        let p = dwi_dir.join(format!("sub-9116_ses-Day14_space-T1w_desc-{metric}_dwi.nii.gz"));
        assert!(p.is_file(), "{}", p.display());
    }
    let mask = root
        .path()
        .join("derivatives/pdti2/sub-9116/ses-Day14/anat/sub-9116_ses-Day14_desc-brain_mask.nii.gz");
    assert!(!MaskVolume::open(&mask).unwrap().is_empty());
    let staging = root
        .path()
        .join("derivatives/pdti2/sub-9116/ses-Day14/work/.staging");
    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);

    let calls = tools.calls().len();
    let second = run_dti(root.path(), DtiVariant::T1Space, &tools);
    assert_eq!(second.exit_code(), 0);
    assert!(outcomes(&second, "Day14").iter().all(|o| *o == "skipped"));
    assert_eq!(tools.calls().len(), calls);
}

#[test]
fn session_without_bvec_is_excluded() {
    let root = tempfile::tempdir().unwrap();
    support::raw_session(root.path(), "9116", "Day14", &[]);
    support::raw_session(root.path(), "9116", "Day7", &[".bvec"]);

    let report = run_dti(root.path(), DtiVariant::Native, &ScriptedTools::new());
    assert_eq!(report.exit_code(), 0);
    let day7 = report.session("Day7").unwrap();
    assert!(matches!(day7.status, SessionStatus::SkippedNoInputs));
    assert!(day7.output_dir.is_none());
    assert!(!root.path().join("derivatives/pigdti/sub-9116/ses-Day7").exists());

    let fa = root
        .path()
        .join("derivatives/pigdti/sub-9116/ses-Day14/dwi/sub-9116_ses-Day14_desc-FA_dwi.nii.gz");
    assert!(fa.is_file());
}

#[test]
fn failed_stage_stops_session_and_resumes_later() {
    let root = tempfile::tempdir().unwrap();
    support::raw_session(root.path(), "9116", "A", &[]);
    support::raw_session(root.path(), "9116", "B", &[]);

    let broken = ScriptedTools::failing("dwifslpreproc");
    let report = run_dti(root.path(), DtiVariant::Native, &broken);
    assert_eq!(report.exit_code(), 1);
    for ses in ["A", "B"] {
        match &report.session(ses).unwrap().status {
            SessionStatus::PartialFailure { stage, .. } => assert_eq!(stage, "dwi_preproc"),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(outcomes(&report, ses).last(), Some(&"failed"));
    }
    let preproc = root
        .path()
        .join("derivatives/pigdti/sub-9116/ses-A/dwi/sub-9116_ses-A_desc-preproc_dwi.nii.gz");
    assert!(!preproc.exists());

    let fixed = ScriptedTools::new();
    let resumed = run_dti(root.path(), DtiVariant::Native, &fixed);
    assert_eq!(resumed.exit_code(), 0);
    let a = outcomes(&resumed, "A");
    assert_eq!(a[..3], ["skipped", "skipped", "skipped"]);
    assert!(!fixed.calls().iter().any(|t| t == "dwidenoise"));
    assert!(preproc.is_file());
}

#[test]
fn atlas_registration_of_scalars() {
    let root = tempfile::tempdir().unwrap();
    support::raw_session(root.path(), "9116", "Day14", &[]);
    let tools = ScriptedTools::new();
    assert_eq!(run_dti(root.path(), DtiVariant::Native, &tools).exit_code(), 0);

    let atlas_dir = support::atlas_dir(root.path(), &["Corpus_Callosum", "Fornix"]);
    support::tissue_maps(&atlas_dir, &["WM"]);
    let cfg = PipelineConfig::default();
    let tb = Toolbox::new(&cfg, None);
    let input = DerivativeTree::new(root.path(), "pigdti").unwrap();
    let output = DerivativeTree::new(root.path(), "atlas_space").unwrap();
    let opts = scalar_options(&atlas_dir, &cfg, "SyN");
    let probe = DerivativeProbe::new(input, AtlasTarget::Scalar);
    let discovery = discover(&probe, "9116", &SessionFilter::Only("Day14".into())).unwrap();
    assert_eq!(discovery.sessions[0].inputs.apply.len(), 3);

    let report = PipelineRunner::new(&tools)
        .run_batch("9116", discovery, |s| atlas::plan(&tb, &output, s, &opts))
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(outcomes(&report, "Day14").iter().all(|o| *o == "completed"));

    let dir = root.path().join("derivatives/atlas_space/sub-9116/ses-Day14/dwi");
    for f in [
        "sub-9116_ses-Day14_space-Atlas_desc-FA_dwi.nii.gz",
        "sub-9116_ses-Day14_space-Atlas_desc-RD_dwi.nii.gz",
        "sub-9116_ses-Day14_space-Atlas_desc-brain_mask.nii.gz",
        "sub-9116_ses-Day14_desc-toAtlas0_xfm.nii.gz",
        "sub-9116_ses-Day14_desc-toAtlas1_xfm.mat",
    ] {
        assert!(dir.join(f).is_file(), "{f}");
    }
    let csv = fs::read_to_string(dir.join("sub-9116_ses-Day14_space-Atlas_desc-MD_metrics.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("metric,Corpus_Callosum,Fornix,WM"));
    assert_eq!(lines.next(), Some("mean,1,1,1"));
}

fn scalar_options(atlas_dir: &Path, cfg: &PipelineConfig, transform_type: &str) -> AtlasOptions {
    AtlasOptions {
        target: AtlasTarget::Scalar,
        template: find_template(atlas_dir, AtlasTarget::Scalar).unwrap(),
        transform_type: transform_type.to_string(),
        reorientation: Reorientation::identity(),
        rois: roi::atlas_masks(atlas_dir, &cfg.roi_dir_name, &cfg.tpm_dir_name).unwrap(),
    }
}

#[test]
fn registered_images_share_template_grid() {
    let root = tempfile::tempdir().unwrap();
    support::raw_session(root.path(), "9116", "Day14", &[]);
    let tools = ScriptedTools::new();
    assert_eq!(run_dti(root.path(), DtiVariant::Native, &tools).exit_code(), 0);

    let atlas_dir = support::atlas_dir(root.path(), &["Corpus_Callosum"]);
    let cfg = PipelineConfig::default();
    let tb = Toolbox::new(&cfg, None);
    let input = DerivativeTree::new(root.path(), "pigdti").unwrap();
    let output = DerivativeTree::new(root.path(), "atlas_space").unwrap();
    let opts = scalar_options(&atlas_dir, &cfg, "SyNOnly");
    let probe = DerivativeProbe::new(input, AtlasTarget::Scalar);
    let discovery = discover(&probe, "9116", &SessionFilter::Only("Day14".into())).unwrap();
    let session = &discovery.sessions[0];
    let plan = atlas::plan(&tb, &output, session, &opts).unwrap();

    let tracker = &plan.tracker;
    let fixed = tracker.find(&opts.template).unwrap();
    let moving = tracker.find(&session.inputs.moving).unwrap();
    assert!(tracker.assert_same_space(fixed, moving).is_err());

    let dir = root.path().join("derivatives/atlas_space/sub-9116/ses-Day14/dwi");
    let mut registered = vec![dir.join("sub-9116_ses-Day14_space-Atlas_desc-FA_dwi.nii.gz")];
    for m in ["MD", "AD", "RD"] {
        registered.push(dir.join(format!("sub-9116_ses-Day14_space-Atlas_desc-{m}_dwi.nii.gz")));
    }
    registered.push(dir.join("sub-9116_ses-Day14_space-Atlas_desc-brain_mask.nii.gz"));
    for out in registered.iter() {
        let h = tracker.find(out).unwrap_or_else(|| panic!("{} not planned", out.display()));
        tracker.assert_same_space(fixed, h).unwrap();
        assert_eq!(tracker.resolve_space_tag(h).unwrap(), Some("Atlas"));
    }

    let (status, _) = PipelineRunner::new(&tools).run_session(plan);
    assert!(matches!(status, SessionStatus::Success));
    for out in registered.iter() {
        assert!(out.is_file(), "{}", out.display());
    }
    assert!(dir.join("sub-9116_ses-Day14_desc-toAtlas0_xfm.nii.gz").is_file());
    assert!(!dir.join("sub-9116_ses-Day14_desc-toAtlas1_xfm.mat").exists());
}

#[test]
fn dry_run_writes_nothing() {
    let root = tempfile::tempdir().unwrap();
    support::raw_session(root.path(), "9116", "Day14", &[]);
    let cfg = PipelineConfig::default();
    let tb = Toolbox::new(&cfg, None);
    let tree = DerivativeTree::new(root.path(), "pdti2").unwrap();
    let probe = RawDwiProbe::new(root.path(), &cfg.phase_encoding);
    let discovery = discover(&probe, "9116", &SessionFilter::All).unwrap();
    let tools = ScriptedTools::new();
    let opts = DtiOptions::new(DtiVariant::T1Space);

    let report = PipelineRunner::new(&tools)
        .dry_run(true)
        .run_batch("9116", discovery, |s| dwi::plan(&tb, &tree, s, &opts))
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(outcomes(&report, "Day14").iter().all(|o| *o == "planned"));
    assert!(tools.calls().is_empty());
    assert!(!root.path().join("derivatives").exists());
}
