use gallery::{
    EntryId, StepId, StepStatus, SubmissionCoordinator, SubmissionFlow,
    SubmissionOutcome, SubmissionPhase, SubmissionProgress, SubmitError,
    UploadQueue,
};
use payloads::{ImageId, VillaDetails, VillaId};
use reqwest::StatusCode;
use std::time::Duration;
use test_helpers::{
    MB, MockBackend, ScriptedPersist, image_file, jpeg, villa_details,
};
use tokio::time::Instant;

use crate::{VILLA, coordinator, new_queue, villa_queue};

fn edit(current_thumbnail: Option<ImageId>) -> SubmissionFlow {
    SubmissionFlow::Edit {
        villa_id: VILLA,
        current_thumbnail,
    }
}

fn step_status(
    progress: &SubmissionProgress,
    id: StepId,
) -> Option<StepStatus> {
    progress.step(id).map(|step| step.status)
}

fn hydrate(queue: &UploadQueue<MockBackend>, ids: &[i64]) {
    let urls: Vec<String> = ids
        .iter()
        .map(|id| format!("https://cdn.villas.test/images/{id}.jpg"))
        .collect();
    let server_ids: Vec<_> = ids.iter().map(|&id| Some(ImageId(id))).collect();
    queue.hydrate_existing(&urls, &server_ids);
}

/// Submit the standard villa details, persisting through `persist`.
async fn submit(
    coordinator: &SubmissionCoordinator,
    flow: SubmissionFlow,
    queue: &UploadQueue<MockBackend>,
    thumbnail: Option<EntryId>,
    persist: &ScriptedPersist<VillaId>,
) -> Result<SubmissionOutcome<VillaId>, SubmitError> {
    let details = villa_details();
    coordinator
        .submit(flow, &details, queue, thumbnail, move |_: &VillaDetails| {
            persist.call()
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn create_flow_end_to_end() -> anyhow::Result<()> {
    let (queue, backend) = new_queue(Default::default());
    let report = queue.add_files(vec![
        jpeg("pool.jpg"),
        jpeg("terrace.jpg"),
        image_file("aerial.jpg", "image/jpeg", 11 * MB),
    ]);
    assert_eq!(queue.len(), 2);
    assert_eq!(report.errors.len(), 1);

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VillaId(42));
    let started = Instant::now();

    let outcome = submit(
        &coordinator,
        SubmissionFlow::Create,
        &queue,
        None,
        &persist,
    )
    .await?;

    assert_eq!(outcome.saved, VillaId(42));
    assert_eq!(outcome.thumbnail, Some(report.added[0]));
    assert!(outcome.partial_upload.is_none());
    assert_eq!(persist.call_count(), 1);
    // Images travel with the create request.
    assert_eq!(backend.total_upload_attempts(), 0);
    assert!(backend.thumbnails().is_empty());
    // Consistency wait plus the completion hold.
    assert!(started.elapsed() >= Duration::from_millis(800));

    let progress = coordinator.progress();
    assert_eq!(progress.phase, SubmissionPhase::Done);
    assert!(
        progress
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed)
    );
    assert_eq!(progress.percent(), 100);
    assert_eq!(coordinator.error(), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn edit_flow_uploads_then_sets_chosen_thumbnail() -> anyhow::Result<()> {
    let (queue, backend) = villa_queue();
    hydrate(&queue, &[10]);
    let new_image = queue.add_files(vec![jpeg("sunset.jpg")]).added[0];

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VILLA);
    let flow = edit(Some(ImageId(10)));
    let outcome =
        submit(&coordinator, flow, &queue, Some(new_image), &persist).await?;

    let uploaded = queue
        .get(new_image)
        .and_then(|entry| entry.server_id)
        .ok_or_else(|| anyhow::anyhow!("image was not uploaded"))?;
    assert_eq!(backend.upload_owners(), [Some(VILLA)]);
    assert_eq!(backend.thumbnails(), [(VILLA, uploaded)]);
    assert_eq!(outcome.thumbnail, Some(new_image));
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(coordinator.progress().phase, SubmissionPhase::Done);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn upload_started_elsewhere_is_awaited_before_thumbnail()
-> anyhow::Result<()> {
    let (queue, backend) = villa_queue();
    let id = queue.add_files(vec![jpeg("only.jpg")]).added[0];

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VILLA);
    let (uploaded, outcome) = tokio::join!(
        queue.upload_one(id),
        submit(&coordinator, edit(None), &queue, None, &persist),
    );

    uploaded?;
    let outcome = outcome?;
    let server_id = queue
        .get(id)
        .and_then(|entry| entry.server_id)
        .ok_or_else(|| anyhow::anyhow!("image was not uploaded"))?;
    assert_eq!(backend.upload_attempts("only.jpg"), 1);
    assert_eq!(outcome.thumbnail, Some(id));
    assert_eq!(backend.thumbnails(), [(VILLA, server_id)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unchanged_thumbnail_is_not_reassigned() -> anyhow::Result<()> {
    let (queue, backend) = villa_queue();
    hydrate(&queue, &[10, 11]);

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VILLA);
    let flow = edit(Some(ImageId(10)));
    let outcome = submit(&coordinator, flow, &queue, None, &persist).await?;

    assert_eq!(outcome.thumbnail, Some(EntryId::Backend(ImageId(10))));
    assert!(backend.thumbnails().is_empty());
    assert_eq!(backend.total_upload_attempts(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_thumbnail_choice_falls_back_to_first_image()
-> anyhow::Result<()> {
    let (queue, backend) = villa_queue();
    hydrate(&queue, &[10, 11]);
    queue.reorder(1, 0)?;

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VILLA);
    let choice = Some(EntryId::Local(404));
    let outcome =
        submit(&coordinator, edit(None), &queue, choice, &persist).await?;

    assert_eq!(outcome.thumbnail, Some(EntryId::Backend(ImageId(11))));
    assert_eq!(backend.thumbnails(), [(VILLA, ImageId(11))]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn thumbnail_failure_does_not_stop_the_save() -> anyhow::Result<()> {
    let (queue, backend) = villa_queue();
    hydrate(&queue, &[10]);
    backend.fail_thumbnail();

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VILLA);
    submit(&coordinator, edit(None), &queue, None, &persist).await?;

    let progress = coordinator.progress();
    assert_eq!(
        step_status(&progress, StepId::Thumbnail),
        Some(StepStatus::Completed)
    );
    assert_eq!(progress.phase, SubmissionPhase::Done);
    assert_eq!(persist.call_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn total_upload_failure_halts_before_persisting() {
    let (queue, backend) = villa_queue();
    queue.add_files(vec![jpeg("a.jpg"), jpeg("b.jpg")]);
    backend.always_fail_uploads("a.jpg");
    backend.always_fail_uploads("b.jpg");

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VILLA);
    let result = submit(&coordinator, edit(None), &queue, None, &persist).await;

    let Err(SubmitError::Uploads(partial)) = result else {
        panic!("expected the upload step to fail");
    };
    assert_eq!(partial.failed.len(), 2);
    assert_eq!(persist.call_count(), 0);
    assert!(backend.thumbnails().is_empty());

    let progress = coordinator.progress();
    assert_eq!(progress.phase, SubmissionPhase::Failed);
    assert_eq!(
        step_status(&progress, StepId::Upload),
        Some(StepStatus::Error)
    );
    assert_eq!(
        step_status(&progress, StepId::Thumbnail),
        Some(StepStatus::Pending)
    );
    assert_eq!(
        step_status(&progress, StepId::Persist),
        Some(StepStatus::Pending)
    );
    assert!(coordinator.error().is_some_and(|e| e.contains("2 of 2")));
}

#[tokio::test(start_paused = true)]
async fn partial_upload_failure_still_saves() -> anyhow::Result<()> {
    let (queue, backend) = villa_queue();
    let added = queue.add_files(vec![jpeg("a.jpg"), jpeg("b.jpg")]).added;
    backend.always_fail_uploads("b.jpg");

    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_ok(VILLA);
    let outcome =
        submit(&coordinator, edit(None), &queue, None, &persist).await?;

    let partial = outcome
        .partial_upload
        .ok_or_else(|| anyhow::anyhow!("expected a partial upload"))?;
    assert_eq!(partial.uploaded_urls.len(), 1);
    assert_eq!(partial.failed[0].0, added[1]);
    assert_eq!(persist.call_count(), 1);
    assert_eq!(
        step_status(&coordinator.progress(), StepId::Upload),
        Some(StepStatus::Completed)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transient_persist_failures_back_off_and_recover() -> anyhow::Result<()>
{
    let (queue, _) = villa_queue();
    let coordinator = coordinator();
    let persist = ScriptedPersist::new()
        .then_fail(StatusCode::CONFLICT, "could not obtain lock on row")
        .then_fail(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
        .then_ok(VILLA);

    let outcome =
        submit(&coordinator, edit(None), &queue, None, &persist).await?;

    assert_eq!(outcome.saved, VILLA);
    assert_eq!(persist.call_count(), 3);
    let gaps = persist.gaps();
    assert_eq!(gaps.len(), 2);
    let close_to = |gap: Duration, secs: u64| {
        gap >= Duration::from_secs(secs)
            && gap < Duration::from_secs(secs) + Duration::from_millis(50)
    };
    assert!(close_to(gaps[0], 1), "first backoff was {:?}", gaps[0]);
    assert!(close_to(gaps[1], 2), "second backoff was {:?}", gaps[1]);
    assert_eq!(coordinator.progress().phase, SubmissionPhase::Done);
    assert_eq!(coordinator.error(), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn non_transient_persist_failure_escalates_immediately() {
    let (queue, _) = villa_queue();
    let coordinator = coordinator();
    let persist = ScriptedPersist::new().then_fail(
        StatusCode::UNPROCESSABLE_ENTITY,
        "price_per_night must be positive",
    );

    let result = submit(&coordinator, edit(None), &queue, None, &persist).await;

    let Err(SubmitError::Persist { attempts, source }) = result else {
        panic!("expected the persist step to fail");
    };
    assert_eq!(attempts, 1);
    assert_eq!(source.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
    assert_eq!(persist.call_count(), 1);

    let progress = coordinator.progress();
    assert_eq!(progress.phase, SubmissionPhase::Failed);
    assert_eq!(
        step_status(&progress, StepId::Persist),
        Some(StepStatus::Error)
    );
    assert_eq!(
        coordinator.error().as_deref(),
        Some("price_per_night must be positive")
    );
}

#[tokio::test(start_paused = true)]
async fn blocked_request_is_not_retried() {
    let (queue, _) = villa_queue();
    let coordinator = coordinator();
    let persist = ScriptedPersist::new()
        .then_fail(StatusCode::BAD_REQUEST, "Request blocked")
        .then_ok(VILLA);

    let result = submit(&coordinator, edit(None), &queue, None, &persist).await;

    assert!(matches!(
        result,
        Err(SubmitError::Persist { attempts: 1, .. })
    ));
    assert_eq!(persist.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn persist_gives_up_after_three_transient_failures() {
    let (queue, _) = villa_queue();
    let coordinator = coordinator();
    let persist = ScriptedPersist::new()
        .then_fail(StatusCode::INTERNAL_SERVER_ERROR, "deadlock detected")
        .then_fail(StatusCode::INTERNAL_SERVER_ERROR, "deadlock detected")
        .then_fail(StatusCode::INTERNAL_SERVER_ERROR, "deadlock detected")
        .then_ok(VILLA);

    let result = submit(&coordinator, edit(None), &queue, None, &persist).await;

    assert!(matches!(
        result,
        Err(SubmitError::Persist { attempts: 3, .. })
    ));
    assert_eq!(persist.call_count(), 3);
    assert_eq!(coordinator.progress().phase, SubmissionPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_the_final_state() -> anyhow::Result<()> {
    let (queue, _) = villa_queue();
    let coordinator = coordinator();
    let mut progress = coordinator.subscribe();
    assert_eq!(progress.borrow_and_update().phase, SubmissionPhase::Idle);

    let persist = ScriptedPersist::new().then_ok(VILLA);
    submit(&coordinator, edit(None), &queue, None, &persist).await?;

    assert!(progress.has_changed()?);
    let last = progress.borrow_and_update().clone();
    assert_eq!(last.phase, SubmissionPhase::Done);
    assert_eq!(last.percent(), 100);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn resubmitting_starts_from_fresh_steps() -> anyhow::Result<()> {
    let (queue, _) = villa_queue();
    let coordinator = coordinator();
    let persist = ScriptedPersist::new()
        .then_fail(StatusCode::BAD_REQUEST, "name is required")
        .then_ok(VILLA);

    let first = submit(&coordinator, edit(None), &queue, None, &persist).await;
    assert!(first.is_err());
    assert!(coordinator.error().is_some());

    submit(&coordinator, edit(None), &queue, None, &persist).await?;

    assert_eq!(coordinator.error(), None);
    assert_eq!(coordinator.progress().phase, SubmissionPhase::Done);
    Ok(())
}
