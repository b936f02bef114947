use crate::future_feature_flags::{scoped_test, FeatureFlag};
use crate::job_group::populate_group_for_job;
use crate::proc::{
    set_job_control_mode, Job, JobControl, JobProperties, Process, ProcessType,
};
use crate::tests::prelude::*;
use crate::wchar::prelude::*;
use std::sync::Arc;

fn make_job(background: bool, types: &[ProcessType]) -> Job {
    let mut job = Job::new(
        JobProperties {
            initial_background: background,
            ..Default::default()
        },
        L!("cmd").to_owned(),
    );
    for &typ in types {
        let mut p = Process::new();
        p.typ = typ;
        p.set_argv(vec![L!("true").to_owned()]);
        job.processes.push(Box::new(p));
    }
    job
}

#[test]
#[serial]
fn test_job_ids_increase_past_any_in_use() {
    test_init();
    let mut j1 = make_job(false, &[ProcessType::external]);
    populate_group_for_job(&mut j1, None);
    let mut j2 = make_job(false, &[ProcessType::external]);
    populate_group_for_job(&mut j2, None);

    let id1 = j1.job_id().as_num();
    let id2 = j2.job_id().as_num();
    assert!(id1 > 0);
    assert_eq!(id2, id1 + 1);

    // Even with the first id free again, new ids stay above the largest in use.
    drop(j1);
    let mut j3 = make_job(false, &[ProcessType::external]);
    populate_group_for_job(&mut j3, None);
    assert_eq!(j3.job_id().as_num(), id2 + 1);
}

#[test]
#[serial]
fn test_internal_group_for_simple_function() {
    test_init();
    // A simple foreground execution of an internal proc gets an internal group: no job id, no
    // pgid, invisible to `jobs`.
    let mut job = make_job(false, &[ProcessType::function]);
    populate_group_for_job(&mut job, None);
    let group = job.group();
    assert!(group.is_internal());
    assert!(!group.has_job_id());
    assert!(group.get_pgid().is_none());
    assert!(!group.wants_job_control());
}

#[test]
#[serial]
fn test_background_job_gets_new_group() {
    test_init();
    // Background jobs always get a new group, even when one is proposed.
    let mut parent = make_job(false, &[ProcessType::function]);
    populate_group_for_job(&mut parent, None);
    let proposed = Arc::clone(parent.group.as_ref().unwrap());

    let mut bg = make_job(true, &[ProcessType::function]);
    populate_group_for_job(&mut bg, Some(&proposed));
    assert!(!Arc::ptr_eq(&proposed, bg.group.as_ref().unwrap()));
    assert!(bg.group().has_job_id());
    assert!(!bg.flags().constructed);
    assert!(bg.flags().is_group_root);
}

#[test]
#[serial]
fn test_pipeline_inherits_group() {
    test_init();
    // A nested foreground pipeline reuses a proposed non-internal group.
    let mut root = make_job(false, &[ProcessType::external, ProcessType::external]);
    populate_group_for_job(&mut root, None);
    let proposed = Arc::clone(root.group.as_ref().unwrap());

    let mut nested = make_job(false, &[ProcessType::external]);
    populate_group_for_job(&mut nested, Some(&proposed));
    assert!(Arc::ptr_eq(&proposed, nested.group.as_ref().unwrap()));
    assert!(!nested.flags().is_group_root);
}

#[test]
#[serial]
fn test_pgid_owner_forked_for_concurrent_mixed_pipeline() {
    test_init();
    // With concurrent execution and job control on, a pipeline mixing external and internal
    // processes gets a placeholder child forked to own the pgid, so that every process - forked
    // or cooperatively scheduled - can share one process group for signal delivery.
    set_job_control_mode(JobControl::all);
    scoped_test(FeatureFlag::Concurrent, true, || {
        let mut job = make_job(false, &[ProcessType::external, ProcessType::function]);
        populate_group_for_job(&mut job, None);
        let group = job.group();
        assert!(group.owns_pgid());
        let pgid = group.get_pgid().expect("Group should have a pgid");
        assert_ne!(pgid.as_pid_t(), unsafe { libc::getpgrp() });
        // Dropping the job reaps the placeholder via waitpid.
        drop(job);
    });
    set_job_control_mode(JobControl::interactive);
}

#[test]
#[serial]
fn test_no_owner_fork_when_single_threaded() {
    test_init();
    // With the concurrent feature off we must never fork a pgid owner.
    set_job_control_mode(JobControl::all);
    scoped_test(FeatureFlag::Concurrent, false, || {
        let mut job = make_job(false, &[ProcessType::external, ProcessType::function]);
        populate_group_for_job(&mut job, None);
        assert!(!job.group().owns_pgid());
        assert!(job.group().get_pgid().is_none());
    });
    set_job_control_mode(JobControl::interactive);
}
