use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use truvlm::VideoConstraints;
use truvlm_vidprep::planner::{plan, PatchGeometry};
use truvlm_vidprep::sampler::{frame_count, frame_indices, sample};
use truvlm_vidprep::VideoMetadata;

const CASES: usize = 2_000;
const GEOMETRY: PatchGeometry = PatchGeometry {
    unit: 32,
    temporal_patch_size: 2,
};

fn random_metadata(rng: &mut StdRng) -> VideoMetadata {
    let fps = *[23.976, 24.0, 25.0, 29.97, 30.0, 50.0, 60.0]
        .get(rng.gen_range(0..7))
        .unwrap();
    VideoMetadata {
        width: rng.gen_range(16..=3840),
        height: rng.gen_range(16..=2160),
        fps,
        frame_count: rng.gen_range(1..=60_000),
    }
}

fn random_constraints(rng: &mut StdRng) -> VideoConstraints {
    VideoConstraints {
        fps: rng.gen_range(0.1..8.0),
        max_frames: rng.gen_range(2..=1024),
        ..Default::default()
    }
}

#[test]
fn test_frame_count_matches_clamped_round() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..CASES {
        let duration: f64 = rng.gen_range(0.0..3600.0);
        let fps: f64 = rng.gen_range(0.1..10.0);
        let max_frames = rng.gen_range(2..=1024);
        let expected = ((duration * fps).round() as usize).clamp(2, max_frames);
        assert_eq!(frame_count(duration, fps, None, 2, max_frames), expected);
    }
}

#[test]
fn test_indices_sorted_in_range_and_endpoints_kept() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..CASES {
        let native = rng.gen_range(1..=20_000);
        let nframes = rng.gen_range(2..=768);
        let indices = frame_indices(native, nframes);
        assert_eq!(indices.len(), nframes);
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));
        assert!(indices.iter().all(|&i| i < native));
        assert_eq!(indices[0], 0);
        assert_eq!(*indices.last().unwrap(), native - 1);
    }
}

#[test]
fn test_plans_are_patch_aligned_and_within_total_budget() {
    let mut rng = StdRng::seed_from_u64(23);
    for _ in 0..CASES {
        let meta = random_metadata(&mut rng);
        let constraints = random_constraints(&mut rng);
        let selection = sample(&meta, &constraints, 2, 2).unwrap();
        let p = plan(meta.width, meta.height, selection.len(), &constraints, GEOMETRY).unwrap();

        assert_eq!(p.width % 32, 0, "{:?} -> {:?}", meta, p);
        assert_eq!(p.height % 32, 0, "{:?} -> {:?}", meta, p);
        assert!(p.width >= 32 && p.height >= 32);
        assert!(p.pixels_per_frame() <= p.per_frame_budget);
        assert!(p.pixels_per_frame() <= constraints.max_pixels);
        assert!(
            p.total_pixels() <= constraints.total_pixels,
            "{:?} frames={} -> {:?}",
            meta,
            selection.len(),
            p
        );
        assert!(selection.len() * p.pixels_per_frame() as usize <= constraints.total_pixels as usize);
    }
}

#[test]
fn test_more_frames_never_increase_resolution() {
    let mut rng = StdRng::seed_from_u64(31);
    for _ in 0..500 {
        let meta = random_metadata(&mut rng);
        let mut constraints = VideoConstraints {
            fps: rng.gen_range(0.5..8.0),
            ..Default::default()
        };
        let mut previous = u64::MAX;
        for max_frames in (2..=1024).step_by(37) {
            constraints.max_frames = max_frames;
            let selection = sample(&meta, &constraints, 2, 2).unwrap();
            let p = plan(meta.width, meta.height, selection.len(), &constraints, GEOMETRY)
                .unwrap();
            assert!(
                p.pixels_per_frame() <= previous,
                "max_frames={} grew {:?} past {}",
                max_frames,
                p,
                previous
            );
            previous = p.pixels_per_frame();
        }
    }
}

#[test]
fn test_identical_inputs_are_deterministic() {
    let mut rng = StdRng::seed_from_u64(43);
    for _ in 0..200 {
        let meta = random_metadata(&mut rng);
        let constraints = random_constraints(&mut rng);
        let a = sample(&meta, &constraints, 2, 2).unwrap();
        let b = sample(&meta.clone(), &constraints.clone(), 2, 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            plan(meta.width, meta.height, a.len(), &constraints, GEOMETRY).unwrap(),
            plan(meta.width, meta.height, b.len(), &constraints, GEOMETRY).unwrap()
        );
    }
}

#[test]
fn test_default_budget_scenario() {
    let constraints = VideoConstraints::default();
    let meta = VideoMetadata {
        width: 1280,
        height: 720,
        fps: 30.0,
        frame_count: 300,
    };
    let selection = sample(&meta, &constraints, 2, 2).unwrap();
    assert_eq!(selection.len(), 20);
    for (i, index) in selection.indices.iter().enumerate() {
        assert_eq!(*index, ((i * 299) as f64 / 19.0).round() as usize);
    }

    let p = plan(meta.width, meta.height, 20, &constraints, GEOMETRY).unwrap();
    assert_eq!(p.per_frame_budget, 262_144);
    assert!(p.pixels_per_frame() <= 262_144);
    assert_eq!((p.width % 32, p.height % 32), (0, 0));
}

#[test]
fn test_padded_frames_stay_within_max_frames() {
    let mut rng = StdRng::seed_from_u64(53);
    for _ in 0..CASES {
        let meta = random_metadata(&mut rng);
        let constraints = random_constraints(&mut rng);
        let selection = sample(&meta, &constraints, 2, 2).unwrap();
        let p = plan(meta.width, meta.height, selection.len(), &constraints, GEOMETRY).unwrap();
        assert!(
            p.frames <= constraints.max_frames,
            "max_frames={} padded to {}",
            constraints.max_frames,
            p.frames
        );
    }
}
