//! Cancelling instances that hold open message subscriptions.

mod common;

use common::{vars, TestCluster, RESEND_TIMEOUT_MS};
use gatecore::codec::SubscriptionCommand;
use gatecore::record::{
    MessageSubscriptionIntent, WorkflowInstanceIntent, WorkflowInstanceSubscriptionIntent,
};
use gatecore::{NodeSpec, ProcessDefinition, RejectionType, START_PARTITION_ID};
use gateruntime::CommandResponse;
use serde_json::json;

const SUBSCRIPTIONS: usize = 3;

fn waiting_on_messages() -> ProcessDefinition {
    let mut definition = ProcessDefinition::new("waiting")
        .with_node(NodeSpec::start("start"))
        .with_node(NodeSpec::parallel_gateway("fork"))
        .connect("to-fork", "start", "fork");
    for i in 0..SUBSCRIPTIONS {
        let catch = format!("catch-{}", i);
        let end = format!("end-{}", i);
        definition = definition
            .with_node(NodeSpec::message_catch(&catch, format!("msg-{}", i), "orderId"))
            .with_node(NodeSpec::end(&end))
            .connect(format!("to-{}", catch), "fork", &catch)
            .connect(format!("{}-to-end", catch), &catch, &end);
    }
    definition
}

fn start_waiting(cluster: &mut TestCluster) -> i64 {
    let key = cluster.create_instance("waiting", vars(json!({ "orderId": "order-5" })));
    cluster.deliver_all();
    assert_eq!(
        cluster.events(MessageSubscriptionIntent::Opened).len(),
        SUBSCRIPTIONS
    );
    key
}

fn pending_closes(cluster: &TestCluster) -> usize {
    cluster
        .pending()
        .iter()
        .filter(|(_, command)| matches!(command, SubscriptionCommand::CloseMessageSubscription(_)))
        .count()
}

#[test]
fn cancel_closes_every_subscription_once() {
    let mut cluster = TestCluster::with_process(3, waiting_on_messages());
    let key = start_waiting(&mut cluster);

    assert_eq!(cluster.cancel(key), CommandResponse::Accepted { key });
    assert_eq!(pending_closes(&cluster), SUBSCRIPTIONS);
    assert_eq!(
        cluster
            .events(WorkflowInstanceSubscriptionIntent::Closing)
            .len(),
        SUBSCRIPTIONS
    );

    let terminated = cluster.element_ids(WorkflowInstanceIntent::ElementTerminated);
    assert_eq!(terminated.last().map(String::as_str), Some("waiting"));
    assert_eq!(terminated.len(), SUBSCRIPTIONS + 1);

    cluster.deliver_all();
    assert_eq!(
        cluster.events(MessageSubscriptionIntent::Closed).len(),
        SUBSCRIPTIONS
    );
    assert_eq!(
        cluster
            .events(WorkflowInstanceSubscriptionIntent::Closed)
            .len(),
        SUBSCRIPTIONS
    );
    assert!(cluster
        .processor(START_PARTITION_ID)
        .state()
        .instance_subscriptions
        .is_empty());

    cluster.publish("msg-0", "order-5", vars(json!({})), 60_000);
    cluster.deliver_all();
    assert!(cluster.events(MessageSubscriptionIntent::Correlating).is_empty());
}

#[test]
fn cancelling_twice_is_rejected() {
    let mut cluster = TestCluster::with_process(3, waiting_on_messages());
    let key = start_waiting(&mut cluster);

    cluster.cancel(key);
    cluster.deliver_all();

    match cluster.cancel(key) {
        CommandResponse::Rejected { rejection_type, .. } => {
            assert_eq!(rejection_type, RejectionType::NotFound)
        }
        accepted => panic!("expected rejection, got {:?}", accepted),
    }
    assert_eq!(pending_closes(&cluster), 0);
    assert_eq!(
        cluster
            .events(WorkflowInstanceSubscriptionIntent::Closing)
            .len(),
        SUBSCRIPTIONS
    );
}

#[test]
fn repeated_cancel_resends_lost_close() {
    let mut cluster = TestCluster::with_process(3, waiting_on_messages());
    let key = start_waiting(&mut cluster);

    cluster.cancel(key);
    let lost = cluster.drop_next();
    assert!(matches!(
        lost,
        Some((_, SubscriptionCommand::CloseMessageSubscription(_)))
    ));
    cluster.deliver_all();
    assert_eq!(
        cluster.events(MessageSubscriptionIntent::Closed).len(),
        SUBSCRIPTIONS - 1
    );

    assert!(matches!(cluster.cancel(key), CommandResponse::Rejected { .. }));
    assert_eq!(pending_closes(&cluster), 1);
    cluster.deliver_all();

    assert_eq!(
        cluster.events(MessageSubscriptionIntent::Closed).len(),
        SUBSCRIPTIONS
    );
    assert_eq!(
        cluster
            .events(WorkflowInstanceSubscriptionIntent::Closed)
            .len(),
        SUBSCRIPTIONS
    );
}

#[test]
fn sweep_resends_unacknowledged_closes() {
    let mut cluster = TestCluster::with_process(3, waiting_on_messages());
    let key = start_waiting(&mut cluster);

    cluster.cancel(key);
    assert_eq!(cluster.drop_all(), SUBSCRIPTIONS);

    cluster.advance_clock(RESEND_TIMEOUT_MS as i64 - 1);
    cluster.sweep_all();
    assert_eq!(pending_closes(&cluster), 0);

    cluster.advance_clock(1);
    cluster.sweep_all();
    assert_eq!(pending_closes(&cluster), SUBSCRIPTIONS);

    cluster.deliver_all();
    assert_eq!(
        cluster
            .events(WorkflowInstanceSubscriptionIntent::Closed)
            .len(),
        SUBSCRIPTIONS
    );

    cluster.advance_clock(RESEND_TIMEOUT_MS as i64);
    cluster.sweep_all();
    assert!(cluster.pending().is_empty());
}
