mod common;

use std::time::Duration;

use activity_dump::{
    ManagerError,
    api::{DumpActivityParams, ListActivityDumpsParams, StopActivityDumpParams},
};
use bpf_filters::{
    CGROUPS_WAIT_LIST, CommKey, ContainerIdKey, TRACED_COMMS, TRACED_EVENT_TYPES,
    memory::MemoryTables,
};
use common::*;
use dump_core::{
    event::{CgroupTracingEvent, EventType},
    time::Clock,
};

const CONTAINER: &str = "14467e1a5a6da17b660a130932f1ab568f35586bac8bc5147987d9bba4da08de";

fn dump_params(comm: &str, timeout: u32) -> DumpActivityParams {
    DumpActivityParams {
        comm: comm.to_string(),
        timeout: Some(timeout),
        ..Default::default()
    }
}

#[test]
fn traced_event_types_written_at_startup() {
    let harness = harness();
    let table = harness
        .tables
        .table::<u32, u64>(TRACED_EVENT_TYPES)
        .unwrap();
    for event_type in EventType::ALL {
        assert_eq!(table.get(&event_type.as_raw()), Some(1));
    }
}

#[test]
fn one_dump_per_container() {
    let harness = harness();
    let event = CgroupTracingEvent {
        container_id: CONTAINER.to_string(),
        expiry_raw: harness.clock.monotonic() + Duration::from_secs(600),
    };
    harness.manager.handle_cgroup_tracing_event(&event);
    harness.manager.handle_cgroup_tracing_event(&event);

    let dumps = harness
        .manager
        .list_activity_dumps(&ListActivityDumpsParams {})
        .dumps;
    assert_eq!(dumps.len(), 1);
    assert_eq!(dumps[0].container_id, CONTAINER);
    assert_eq!(dumps[0].timeout, "10m");
    assert!(dumps[0].differentiate_args);
    assert!(dumps[0].with_graph);

    // the wait list is written once, at insertion
    let wait_list = harness
        .tables
        .table::<ContainerIdKey, u64>(CGROUPS_WAIT_LIST)
        .unwrap();
    assert_eq!(wait_list.write_count(), 1);
    let expected = harness.clock.monotonic() + Duration::from_secs(30 * 60 * 10);
    assert_eq!(
        wait_list.get(&ContainerIdKey::new(CONTAINER)),
        Some(expected.raw())
    );
}

#[test]
fn one_dump_per_comm() {
    let harness = harness();
    let first = harness.manager.dump_activity(&dump_params("curl", 1)).unwrap();
    let second = harness.manager.dump_activity(&dump_params("curl", 5)).unwrap();

    // the second request gets the active dump back
    assert_eq!(first, second);
    assert_eq!(second.timeout, "1m");
    let dumps = harness
        .manager
        .list_activity_dumps(&ListActivityDumpsParams {})
        .dumps;
    assert_eq!(dumps.len(), 1);

    let comms = harness
        .tables
        .table::<CommKey, u64>(TRACED_COMMS)
        .unwrap();
    let expected = harness.clock.monotonic() + Duration::from_secs(60);
    assert_eq!(comms.get(&CommKey::new("curl")), Some(expected.raw()));
}

#[test]
fn comms_sharing_the_kernel_key_conflict() {
    let harness = harness();
    let first = harness
        .manager
        .dump_activity(&dump_params("kube-controller-manager", 60))
        .unwrap();
    let second = harness
        .manager
        .dump_activity(&dump_params("kube-controller-other", 1))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(second.timeout, "1h0m0s");

    let dumps = harness
        .manager
        .list_activity_dumps(&ListActivityDumpsParams {})
        .dumps;
    assert_eq!(dumps.len(), 1);

    // the kernel entry keeps the expiry of the dump owning it
    let comms = harness
        .tables
        .table::<CommKey, u64>(TRACED_COMMS)
        .unwrap();
    assert_eq!(comms.write_count(), 1);
    let expected = harness.clock.monotonic() + Duration::from_secs(60 * 60);
    assert_eq!(
        comms.get(&CommKey::new("kube-controller-manager")),
        Some(expected.raw())
    );

    harness
        .manager
        .stop_activity_dump(&StopActivityDumpParams {
            comm: "kube-controller-other".to_string(),
        })
        .unwrap();
    assert!(
        harness
            .manager
            .list_activity_dumps(&ListActivityDumpsParams {})
            .dumps
            .is_empty()
    );
}

#[test]
fn default_timeout() {
    let harness = harness();
    let message = harness
        .manager
        .dump_activity(&DumpActivityParams {
            comm: "sshd".to_string(),
            timeout: None,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(message.timeout, "30m");
}

#[test]
fn zero_timeout_expires_at_next_cleanup() {
    let harness = harness();
    let message = harness.manager.dump_activity(&dump_params("sshd", 0)).unwrap();
    assert_eq!(message.timeout, "0s");

    harness.manager.cleanup();
    assert!(
        harness
            .manager
            .list_activity_dumps(&ListActivityDumpsParams {})
            .dumps
            .is_empty()
    );
}

#[test]
fn empty_comm_is_rejected() {
    let harness = harness();
    let err = harness
        .manager
        .dump_activity(&dump_params("", 1))
        .unwrap_err();
    assert!(matches!(err, ManagerError::StartTracing { .. }));
    assert!(
        harness
            .manager
            .list_activity_dumps(&ListActivityDumpsParams {})
            .dumps
            .is_empty()
    );
}

#[test]
fn list_keeps_insertion_order() {
    let harness = harness();
    for comm in ["nginx", "curl", "sshd"] {
        harness.manager.dump_activity(&dump_params(comm, 1)).unwrap();
    }
    harness
        .manager
        .stop_activity_dump(&StopActivityDumpParams {
            comm: "curl".to_string(),
        })
        .unwrap();

    let comms: Vec<String> = harness
        .manager
        .list_activity_dumps(&ListActivityDumpsParams {})
        .dumps
        .into_iter()
        .map(|dump| dump.comm)
        .collect();
    assert_eq!(comms, ["nginx", "sshd"]);
}

#[test]
fn stop_unknown_comm() {
    let harness = harness();
    harness.manager.dump_activity(&dump_params("curl", 1)).unwrap();
    let before = harness
        .manager
        .list_activity_dumps(&ListActivityDumpsParams {});

    let err = harness
        .manager
        .stop_activity_dump(&StopActivityDumpParams {
            comm: "nginx".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, ManagerError::NotFound(comm) if comm == "nginx"));

    let after = harness
        .manager
        .list_activity_dumps(&ListActivityDumpsParams {});
    assert_eq!(before, after);
}

#[test]
fn filter_write_failures_do_not_prevent_tracing() {
    let harness = harness_with(test_config(), |tables, _, _| {
        tables
            .table::<ContainerIdKey, u64>(CGROUPS_WAIT_LIST)
            .unwrap()
            .fail_puts(true);
        tables
            .table::<CommKey, u64>(TRACED_COMMS)
            .unwrap()
            .fail_puts(true);
    });
    harness
        .manager
        .handle_cgroup_tracing_event(&CgroupTracingEvent {
            container_id: CONTAINER.to_string(),
            expiry_raw: harness.clock.monotonic() + Duration::from_secs(60),
        });
    harness.manager.dump_activity(&dump_params("curl", 1)).unwrap();

    assert_eq!(
        harness
            .manager
            .list_activity_dumps(&ListActivityDumpsParams {})
            .dumps
            .len(),
        2
    );
}

#[test]
fn missing_table_is_fatal() {
    let mut tables = MemoryTables::default();
    tables.create::<u32, u64>(TRACED_EVENT_TYPES);
    assert!(matches!(
        try_harness(test_config(), tables, |_, _, _| {}),
        Err(ManagerError::Filter(_))
    ));
}

#[test]
fn traced_event_types_failure_is_fatal() {
    let result = try_harness(test_config(), MemoryTables::with_all(), |tables, _, _| {
        tables
            .table::<u32, u64>(TRACED_EVENT_TYPES)
            .unwrap()
            .fail_puts(true);
    });
    assert!(matches!(result, Err(ManagerError::Filter(_))));
}
