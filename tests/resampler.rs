use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::Array3;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use volume_resample::{
    AcceleratorAvailability, AnyVolume, CpuInterpolator, Interpolator, Processor, ResampleError,
    ResampleOptions, Resampler, SpacingSpec, Volume,
};

#[derive(Debug, Clone, PartialEq)]
struct Call {
    src: [usize; 3],
    dst: [usize; 3],
    prefilter: bool,
}

/// Records every call and fills the output with its flat index.
struct RecordingInterpolator {
    calls: Rc<RefCell<Vec<Call>>>,
    fail: bool,
}

impl Interpolator for RecordingInterpolator {
    fn processor(&self) -> Processor {
        Processor::GPU
    }

    fn interpolate(
        &self,
        _input: &[f32],
        output: &mut [f32],
        src: [usize; 3],
        dst: [usize; 3],
        prefilter: bool,
    ) -> Result<(), ResampleError> {
        self.calls.borrow_mut().push(Call { src, dst, prefilter });
        if self.fail {
            return Err(ResampleError::Device("out of memory".to_string()));
        }
        for (i, value) in output.iter_mut().enumerate() {
            *value = i as f32;
        }
        Ok(())
    }
}

fn recording_resampler(fail: bool) -> (Resampler, Rc<RefCell<Vec<Call>>>) {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let interpolator = RecordingInterpolator {
        calls: Rc::clone(&calls),
        fail,
    };
    let resampler = Resampler::new(AcceleratorAvailability::Available(Box::new(interpolator)));
    (resampler, calls)
}

fn cpu_options(prefilter: bool) -> ResampleOptions {
    ResampleOptions {
        processor: Processor::CPU,
        prefilter,
    }
}

fn gpu_options(prefilter: bool) -> ResampleOptions {
    ResampleOptions {
        processor: Processor::GPU,
        prefilter,
    }
}

fn gradient(width: usize, height: usize, depth: usize) -> Volume<f32> {
    let data = Array3::from_shape_fn((depth, height, width), |(z, y, x)| {
        x as f32 + 2.0 * y as f32 + 3.0 * z as f32
    });
    Volume::new(data, [1.0; 3])
}

#[test]
fn halves_a_cube_at_double_spacing() {
    let resampler = Resampler::new(AcceleratorAvailability::Unavailable);
    let volume = Volume::new(Array3::<f32>::from_elem((100, 100, 100), 40.0), [0.1; 3]);

    let resampled = resampler
        .fix_spacing(volume, &SpacingSpec::Isotropic(0.2), &cpu_options(true))
        .unwrap();

    assert_eq!(resampled.size(), [50, 50, 50]);
    for (actual, expected) in resampled.spacing.iter().zip([0.2; 3]) {
        assert!((actual - expected).abs() < 1e-12);
    }
    assert!(resampled.data.iter().all(|v| (v - 40.0).abs() < 1e-3));
}

#[test]
fn noop_returns_input_without_calling_the_kernel() {
    let (resampler, calls) = recording_resampler(false);
    let volume = gradient(10, 10, 10);

    // 10 * 1.0 / 1.04 rounds back to 10
    let resampled = resampler
        .fix_spacing(volume.clone(), &SpacingSpec::Isotropic(1.04), &gpu_options(true))
        .unwrap();

    assert!(calls.borrow().is_empty());
    assert_eq!(resampled, volume);
}

#[test]
fn kernel_receives_sizes_and_prefilter_flag() {
    let (resampler, calls) = recording_resampler(false);
    let volume = gradient(6, 5, 4);

    let resampled = resampler
        .fix_spacing(volume, &SpacingSpec::Isotropic(2.0), &gpu_options(false))
        .unwrap();

    // 2.5 rounds half to even
    assert_eq!(
        *calls.borrow(),
        vec![Call {
            src: [6, 5, 4],
            dst: [3, 2, 2],
            prefilter: false,
        }]
    );
    assert_eq!(resampled.size(), [3, 2, 2]);
    assert_eq!(resampled.spacing, [2.0, 2.5, 2.0]);
    // width-fastest placement of the kernel output
    for ((z, y, x), value) in resampled.data.indexed_iter() {
        assert_eq!(*value, (x + 3 * (y + 2 * z)) as f32);
    }
}

#[test]
fn kernel_errors_are_propagated() {
    let (resampler, calls) = recording_resampler(true);
    let err = resampler
        .fix_spacing(gradient(8, 8, 8), &SpacingSpec::Isotropic(2.0), &gpu_options(true))
        .unwrap_err();
    assert!(matches!(err, ResampleError::Device(_)));
    assert_eq!(calls.borrow().len(), 1);
}

/// Counts events logged at ERROR level.
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[test]
fn kernel_errors_are_logged() {
    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors)));

    let (resampler, _calls) = recording_resampler(true);
    let result = tracing::subscriber::with_default(subscriber, || {
        resampler.fix_spacing(gradient(8, 8, 8), &SpacingSpec::Isotropic(2.0), &gpu_options(true))
    });

    assert!(result.is_err());
    assert_eq!(errors.load(Ordering::Relaxed), 1);
}

#[test]
fn rejects_spacing_too_fine_to_allocate() {
    let (resampler, calls) = recording_resampler(false);
    let volume = Volume::new(Array3::<u8>::zeros((100, 100, 100)), [1.0; 3]);

    for options in [gpu_options(true), cpu_options(true)] {
        let err = resampler
            .fix_spacing(volume.clone(), &SpacingSpec::Isotropic(1e-7), &options)
            .unwrap_err();
        assert!(matches!(err, ResampleError::InvalidSpacing(_)), "{err}");
    }
    assert!(calls.borrow().is_empty());
}

#[test]
fn resampling_at_the_achieved_spacing_is_a_noop() {
    let resampler = Resampler::new(AcceleratorAvailability::Unavailable);
    let once = resampler
        .fix_spacing(gradient(10, 10, 10), &SpacingSpec::Isotropic(0.7), &cpu_options(true))
        .unwrap();
    assert_eq!(once.size(), [14, 14, 14]);

    let twice = resampler
        .fix_spacing(once.clone(), &SpacingSpec::Anisotropic(once.spacing), &cpu_options(true))
        .unwrap();
    assert_eq!(twice, once);
}

#[test]
fn origin_and_direction_are_kept() {
    let resampler = Resampler::new(AcceleratorAvailability::Unavailable);
    let origin = [-120.5, 33.0, 7.25];
    let direction = [[0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    let volume = gradient(8, 8, 8).with_origin(origin).with_direction(direction);

    let resampled = resampler
        .fix_spacing(volume, &SpacingSpec::Anisotropic([2.0, 1.0, 4.0]), &cpu_options(true))
        .unwrap();

    assert_eq!(resampled.size(), [4, 8, 2]);
    assert_eq!(resampled.origin, origin);
    assert_eq!(resampled.direction, direction);
}

#[test]
fn backends_agree_on_a_gradient() {
    let accelerator = AcceleratorAvailability::Available(Box::new(CpuInterpolator::new()));
    let resampler = Resampler::new(accelerator);
    let volume = gradient(16, 12, 8);

    for prefilter in [true, false] {
        let gpu = resampler
            .resample(&volume, [8, 6, 4], Processor::GPU, prefilter)
            .unwrap();
        let cpu = resampler
            .resample(&volume, [8, 6, 4], Processor::CPU, prefilter)
            .unwrap();
        assert_eq!(gpu.spacing, cpu.spacing);
        for (a, b) in gpu.data.iter().zip(cpu.data.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }
}

#[test]
fn any_volume_resamples_through_the_gpu_path() {
    let accelerator = AcceleratorAvailability::Available(Box::new(CpuInterpolator::new()));
    let resampler = Resampler::new(accelerator);
    let volume: AnyVolume =
        Volume::new(Array3::<u8>::from_elem((8, 8, 8), 200), [1.0; 3]).into();

    let resampled = volume
        .fix_spacing(&resampler, &SpacingSpec::Isotropic(2.0), &gpu_options(false))
        .unwrap();

    let AnyVolume::U8(resampled) = resampled else {
        panic!("sample type changed");
    };
    assert_eq!(resampled.size(), [4, 4, 4]);
    assert!(resampled.data.iter().all(|v| (199..=200).contains(v)));
}

#[test]
fn rejects_spacing_with_two_values() {
    assert!(matches!(
        SpacingSpec::from_values(&[0.1, 0.2]),
        Err(ResampleError::InvalidSpacing(_))
    ));
}

#[test]
fn rejects_negative_spacing() {
    assert!(matches!(
        SpacingSpec::from_values(&[-1.0]),
        Err(ResampleError::InvalidSpacing(_))
    ));
}

#[test]
fn rejects_empty_volume() {
    let resampler = Resampler::new(AcceleratorAvailability::Unavailable);
    let volume = Volume::new(Array3::<u16>::zeros((100, 100, 0)), [1.0; 3]);
    assert!(matches!(
        resampler.fix_spacing(volume, &SpacingSpec::Isotropic(0.5), &cpu_options(true)),
        Err(ResampleError::InvalidVolume(_))
    ));
}

#[test]
fn gpu_without_hardware_is_unavailable() {
    let resampler = Resampler::new(AcceleratorAvailability::Unavailable);
    let err = resampler
        .fix_spacing(gradient(10, 10, 10), &SpacingSpec::Isotropic(0.5), &gpu_options(true))
        .unwrap_err();
    assert!(matches!(
        err,
        ResampleError::BackendUnavailable {
            processor: Processor::GPU,
            ..
        }
    ));
}
