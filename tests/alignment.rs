//! Alignment and power mapping over mock piezo stages.

mod common;

use common::{alignment_rig, collect_events, wait_for_event, LEFT, PEAK_DBM, RIGHT};
use iopanel::alignment::{AlignmentEvent, AlignmentSettings, AlignmentTask, MappingSettings, Stage};
use iopanel::bus::Component;
use iopanel::device::mock::MockOp;
use iopanel::device::DeviceId;
use iopanel::error::{AlignmentError, DeviceErrorKind};
use iopanel::Event;
use std::time::Duration;

fn small_map(stage: Stage) -> MappingSettings {
    MappingSettings {
        x_min_nm: -200,
        x_max_nm: 200,
        x_step_nm: 100,
        y_min_nm: -200,
        y_max_nm: 200,
        y_step_nm: 100,
        samples_per_point: 1,
        stage,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_alignment_converges_on_the_optimum() {
    let mut rig = alignment_rig(true);
    let (left, right) = (DeviceId::from(LEFT), DeviceId::from(RIGHT));
    rig.coupling.set_optimum(&left, [38.0, 37.5, 38.5]);
    rig.coupling.set_optimum(&right, [37.5, 37.0, 37.5]);
    let before = rig.coupling.power_dbm();

    rig.aligner.start_alignment(AlignmentSettings::default()).unwrap();
    assert_eq!(rig.aligner.active(), Some(AlignmentTask::Alignment));

    let power = wait_for_event(&mut rig.events, |event| match event {
        Event::Alignment(AlignmentEvent::Aligned { power_dbm }) => Some(*power_dbm),
        Event::Alignment(AlignmentEvent::Failed { message, .. }) => panic!("alignment failed: {}", message),
        _ => None,
    })
    .await;
    assert!(power > before);
    assert!(power > PEAK_DBM - 0.1, "aligned at {} dBm", power);

    // One climb step is 0.37 V, so every climbed axis ends within half a step.
    let left_volts = rig.coupling.voltages(&left).unwrap();
    for (volts, optimum) in left_volts.iter().zip([38.0, 37.5, 38.5]) {
        assert!((volts - optimum).abs() < 0.19, "left stage at {:?}", left_volts);
    }
    let right_volts = rig.coupling.voltages(&right).unwrap();
    assert!((right_volts[1] - 37.0).abs() < 0.19, "right stage at {:?}", right_volts);
    assert_eq!(right_volts[2], 37.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mapping_covers_the_grid_and_restores_the_stage() {
    let mut rig = alignment_rig(false);
    let left = DeviceId::from(LEFT);
    rig.coupling.set_optimum(&left, [37.5, 37.5, 37.5]);

    rig.aligner.start_mapping(small_map(Stage::Left)).unwrap();
    let mut last_progress = None;
    let map = wait_for_event(&mut rig.events, |event| match event {
        Event::Alignment(AlignmentEvent::MapProgress { percent, done, total }) => {
            last_progress = Some((*percent, *done, *total));
            None
        }
        Event::Alignment(AlignmentEvent::Mapped(map)) => Some(map.clone()),
        Event::Alignment(AlignmentEvent::Failed { message, .. }) => panic!("mapping failed: {}", message),
        _ => None,
    })
    .await;

    assert_eq!(last_progress, Some((100, 25, 25)));
    assert_eq!(map.stage, Stage::Left);
    assert_eq!(map.x_um, vec![-0.2, -0.1, 0.0, 0.1, 0.2]);
    assert_eq!(map.y_um.len(), 5);
    assert!(map.power_mw.iter().all(|row| row.len() == 5));
    let (x, y, peak_mw) = map.peak().unwrap();
    assert_eq!((x, y), (0.0, 0.0));
    assert!((peak_mw - 10f64.powf(PEAK_DBM / 10.0)).abs() < 1e-9);
    assert!(map.power_mw[0][0] < peak_mw);

    assert_eq!(rig.coupling.voltages(&left), Some([37.5, 37.5, 37.5]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_cancels_mapping_and_restores_the_stage() {
    let mut rig = alignment_rig(false);
    let left = DeviceId::from(LEFT);
    rig.aligner.start_mapping(MappingSettings::default()).unwrap();

    wait_for_event(&mut rig.events, |event| match event {
        Event::Alignment(AlignmentEvent::MapProgress { done: 3, .. }) => Some(()),
        _ => None,
    })
    .await;
    assert!(rig.aligner.stop());
    assert!(!rig.aligner.stop());

    let cancelled = wait_for_event(&mut rig.events, |event| match event {
        Event::Alignment(AlignmentEvent::Cancelled(task)) => Some(*task),
        Event::Alignment(AlignmentEvent::Mapped(_)) => panic!("mapping ran to completion"),
        _ => None,
    })
    .await;
    assert_eq!(cancelled, AlignmentTask::Mapping);
    assert_eq!(rig.coupling.voltages(&left), Some([37.5, 37.5, 37.5]));
    assert_eq!(rig.aligner.active(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_task_at_a_time() {
    let mut rig = alignment_rig(true);
    rig.aligner.start_mapping(MappingSettings::default()).unwrap();
    assert_eq!(
        rig.aligner.start_alignment(AlignmentSettings::default()),
        Err(AlignmentError::Busy("mapping"))
    );
    assert_eq!(
        rig.aligner.start_mapping(small_map(Stage::Right)),
        Err(AlignmentError::Busy("mapping"))
    );
    assert!(rig.aligner.stop());
    wait_for_event(&mut rig.events, |event| match event {
        Event::Alignment(AlignmentEvent::Cancelled(AlignmentTask::Mapping)) => Some(()),
        _ => None,
    })
    .await;

    rig.aligner.start_mapping(small_map(Stage::Right)).unwrap();
    let map = wait_for_event(&mut rig.events, |event| match event {
        Event::Alignment(AlignmentEvent::Mapped(map)) => Some(map.clone()),
        _ => None,
    })
    .await;
    assert_eq!(map.stage, Stage::Right);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_stage_and_invalid_settings_are_refused() {
    let mut rig = alignment_rig(false);
    assert_eq!(
        rig.aligner.start_alignment(AlignmentSettings::default()),
        Err(AlignmentError::StageUnavailable("right"))
    );
    assert_eq!(
        rig.aligner.start_mapping(small_map(Stage::Right)),
        Err(AlignmentError::StageUnavailable("right"))
    );
    let coarse = MappingSettings {
        x_step_nm: 5000,
        ..small_map(Stage::Left)
    };
    assert!(matches!(
        rig.aligner.start_mapping(coarse),
        Err(AlignmentError::InvalidSettings(_))
    ));
    assert_eq!(rig.aligner.active(), None);

    // Nothing was started, so nothing touched the stage.
    assert!(collect_events(&mut rig.events, Duration::from_millis(50))
        .await
        .iter()
        .all(|event| !matches!(event, Event::Alignment(_))));
    assert!(rig.left.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stage_failure_fails_the_task() {
    let mut rig = alignment_rig(true);
    rig.right.fail_until_cleared(MockOp::Read, DeviceErrorKind::Fatal);
    rig.aligner.start_alignment(AlignmentSettings::default()).unwrap();

    let mut reported = None;
    let task = wait_for_event(&mut rig.events, |event| match event {
        Event::Error(report) if report.component == Component::Alignment => {
            reported = report.device.clone();
            None
        }
        Event::Alignment(AlignmentEvent::Failed { task, .. }) => Some(*task),
        Event::Alignment(AlignmentEvent::Aligned { .. }) => panic!("alignment succeeded"),
        _ => None,
    })
    .await;
    assert_eq!(task, AlignmentTask::Alignment);
    assert_eq!(reported, Some(DeviceId::from(RIGHT)));
    assert!(rig.right.calls().iter().any(|call| call == "read"));
}
