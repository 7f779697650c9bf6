// End-to-end orchestration scenarios over the in-process bus and store

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use petriflow::petri::builder::TransitionSpec;
use petriflow::petri::ShellDispatchArgs;
use petriflow::{
    Broker, DispatchHandler, MemoryBroker, MemoryStore, Message, Net, NetBuilder,
    OrchestratorHandler, Publisher, Routes, ServiceContext, ShellCommandExecutor, Store,
    TransitionKind, TransitionState,
};

struct Harness {
    store: Arc<dyn Store>,
    broker: Arc<MemoryBroker>,
    context: ServiceContext,
    routes: Routes,
}

impl Harness {
    async fn publish(&self, routing_key: &str, message: &Message) {
        self.broker
            .publish(&self.routes.exchange, routing_key, message)
            .await
            .unwrap();
    }

    async fn run(&self) {
        self.broker.run_until_idle(&self.context).await.unwrap();
    }
}

fn setup() -> Harness {
    setup_with_executor(None)
}

fn setup_with_executor(executor: Option<Arc<dyn ShellCommandExecutor>>) -> Harness {
    let routes = Routes::default();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let bindings = petriflow::config::default_bindings(&routes);
    let broker = Arc::new(MemoryBroker::new(&bindings));

    let orchestrator = Arc::new(OrchestratorHandler::new());
    for queue in [
        "petri_create_token",
        "petri_set_token",
        "petri_notify_place",
        "petri_notify_transition",
    ] {
        broker.register_handler(queue, orchestrator.clone());
    }
    if let Some(executor) = executor {
        broker.register_handler("shell_submit", Arc::new(DispatchHandler::new(executor)));
    }

    let context = ServiceContext::new(store.clone(), routes.clone());
    Harness {
        store,
        broker,
        context,
        routes,
    }
}

/// p0 -> t -> p1 with a merge transition
async fn linear_net(store: Arc<dyn Store>) -> Net {
    let mut builder = NetBuilder::new("linear");
    let p0 = builder.add_place("start");
    let p1 = builder.add_place("end");
    let t = builder.add_transition(TransitionSpec::new("go", TransitionKind::Merge));
    builder.add_place_arc_out(p0, t);
    builder.add_trans_arc_out(t, p1);

    let net = builder.store(store).await.unwrap();
    net.add_color_group(1, None, None).await.unwrap();
    net
}

#[tokio::test]
async fn single_transition_fires() {
    let harness = setup();
    let net = linear_net(harness.store.clone()).await;

    harness
        .publish(
            &harness.routes.create_token,
            &Message::CreateToken {
                net_key: net.key().to_string(),
                place_idx: 0,
                color: 0,
                color_group_idx: 0,
                data: None,
            },
        )
        .await;
    harness.run().await;

    // The input marking moved through the transition to p1.
    assert_eq!(net.marking(0, 0).await.unwrap(), None);
    assert!(net.marking(0, 1).await.unwrap().is_some());
    assert_eq!(net.group_marking(0, 0).await.unwrap(), 0);
    assert_eq!(net.group_marking(0, 1).await.unwrap(), 1);
    assert_eq!(
        net.transition(0).state(0).await.unwrap(),
        TransitionState::Fired
    );

    // The start place stamped its first-token timestamp exactly once.
    assert!(net
        .place(0)
        .first_token_timestamp()
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn duplicate_notify_place_fires_once() {
    let harness = setup();
    let net = linear_net(harness.store.clone()).await;

    // Place the token by hand, then deliver the same notification twice.
    let token = net.create_token(0, 0, None).await.unwrap();
    net.put_token(0, &token).await.unwrap();

    let notify = Message::NotifyPlace {
        net_key: net.key().to_string(),
        place_idx: 0,
        color: 0,
    };
    harness.publish(&harness.routes.notify_place, &notify).await;
    harness.publish(&harness.routes.notify_place, &notify).await;
    harness.run().await;

    assert_eq!(
        net.transition(0).state(0).await.unwrap(),
        TransitionState::Fired
    );
    assert!(net.marking(0, 1).await.unwrap().is_some());
    // Exactly two tokens exist: the input and the single merged output.
    assert_eq!(net.marking(0, 1).await.unwrap(), Some(1));
}

#[tokio::test]
async fn join_waits_for_both_inputs() {
    let harness = setup();

    // p0 and p1 both feed t; t feeds p2.
    let mut builder = NetBuilder::new("join");
    let p0 = builder.add_place("left");
    let p1 = builder.add_place("right");
    let p2 = builder.add_place("joined");
    let t = builder.add_transition(TransitionSpec::new("join", TransitionKind::Merge));
    builder.add_place_arc_out(p0, t);
    builder.add_place_arc_out(p1, t);
    builder.add_trans_arc_out(t, p2);
    let net = builder.store(harness.store.clone()).await.unwrap();
    net.add_color_group(1, None, None).await.unwrap();

    // Only the left input is marked: the enabler is recorded but nothing
    // fires and nothing is consumed.
    let left = net.create_token(0, 0, None).await.unwrap();
    net.put_token(p0, &left).await.unwrap();
    harness
        .publish(
            &harness.routes.notify_place,
            &Message::NotifyPlace {
                net_key: net.key().to_string(),
                place_idx: p0,
                color: 0,
            },
        )
        .await;
    harness.run().await;

    assert_eq!(
        net.transition(t).state(0).await.unwrap(),
        TransitionState::Idle
    );
    assert!(net.marking(0, p0).await.unwrap().is_some());
    assert_eq!(net.marking(0, p2).await.unwrap(), None);

    // The right input arrives: the transition fires, both inputs are
    // consumed, the join output lands in p2.
    let right = net.create_token(0, 0, None).await.unwrap();
    net.put_token(p1, &right).await.unwrap();
    harness
        .publish(
            &harness.routes.notify_place,
            &Message::NotifyPlace {
                net_key: net.key().to_string(),
                place_idx: p1,
                color: 0,
            },
        )
        .await;
    harness.run().await;

    assert_eq!(
        net.transition(t).state(0).await.unwrap(),
        TransitionState::Fired
    );
    assert_eq!(net.marking(0, p0).await.unwrap(), None);
    assert_eq!(net.marking(0, p1).await.unwrap(), None);
    assert!(net.marking(0, p2).await.unwrap().is_some());
    assert_eq!(net.group_marking(0, p2).await.unwrap(), 1);
}

#[tokio::test]
async fn spliced_subnet_is_reachable_from_the_host() {
    let harness = setup();

    let mut subnet = NetBuilder::new("subnet");
    let s0 = subnet.add_place("entry");
    let s1 = subnet.add_place("exit");
    let st = subnet.add_transition(TransitionSpec::new("step", TransitionKind::Merge));
    subnet.add_place_arc_out(s0, st);
    subnet.add_trans_arc_out(st, s1);

    let mut host = NetBuilder::new("host");
    let h0 = host.add_place("h0");
    let _h1 = host.add_place("h1");
    let offset = host.splice(&subnet, &BTreeMap::from([(h0, s0)]));

    let net = host.store(harness.store.clone()).await.unwrap();
    net.add_color_group(1, None, None).await.unwrap();

    // The bridge transition wires h0 into the rebased subnet entry.
    let bridge = net.num_transitions().await.unwrap() - 1;
    assert!(net.place(h0).arcs_out().await.unwrap().contains(&bridge));
    assert_eq!(
        net.transition(bridge).arcs_out().await.unwrap(),
        vec![s0 + offset]
    );
    assert_eq!(
        net.transition(bridge).kind().await.unwrap(),
        TransitionKind::Bridge
    );

    // A token at h0 flows across the bridge and through the subnet.
    harness
        .publish(
            &harness.routes.create_token,
            &Message::CreateToken {
                net_key: net.key().to_string(),
                place_idx: h0,
                color: 0,
                color_group_idx: 0,
                data: None,
            },
        )
        .await;
    harness.run().await;

    assert!(net.marking(0, s1 + offset).await.unwrap().is_some());
    assert_eq!(net.marking(0, h0).await.unwrap(), None);
    assert_eq!(net.marking(0, s0 + offset).await.unwrap(), None);
}

/// Executor stub answering a fixed (job_id, success)
struct StubExecutor {
    job_id: u64,
    success: bool,
}

#[async_trait]
impl ShellCommandExecutor for StubExecutor {
    async fn execute(
        &self,
        _command_line: &[String],
        _options: &petriflow::protocol::ExecutorOptions,
    ) -> petriflow::Result<(u64, bool)> {
        Ok((self.job_id, self.success))
    }
}

#[tokio::test]
async fn shell_dispatch_round_trips_through_the_dispatch_service() {
    let harness = setup_with_executor(Some(Arc::new(StubExecutor {
        job_id: 777,
        success: true,
    })));

    // p0 -> dispatch -> p4, with response places pre/ok/fail at p1..p3.
    let mut builder = NetBuilder::new("shell");
    let p0 = builder.add_place("start");
    let pre = builder.add_place("pre_dispatch");
    let ok = builder.add_place("dispatch_success");
    let fail = builder.add_place("dispatch_failure");
    let done = builder.add_place("dispatched");
    let t = builder.add_transition(TransitionSpec::new(
        "run",
        TransitionKind::ShellDispatch(ShellDispatchArgs {
            command_line: vec!["df".into(), "/".into()],
            response_places: BTreeMap::from([
                ("pre_dispatch".into(), pre),
                ("post_dispatch_success".into(), ok),
                ("post_dispatch_failure".into(), fail),
            ]),
            executor_options: Default::default(),
        }),
    ));
    builder.add_place_arc_out(p0, t);
    builder.add_trans_arc_out(t, done);

    let net = builder.store(harness.store.clone()).await.unwrap();
    net.add_color_group(1, None, None).await.unwrap();
    net.set_constant("working_directory", serde_json::json!("/tmp"))
        .await
        .unwrap();

    harness
        .publish(
            &harness.routes.create_token,
            &Message::CreateToken {
                net_key: net.key().to_string(),
                place_idx: p0,
                color: 0,
                color_group_idx: 0,
                data: None,
            },
        )
        .await;
    harness.run().await;

    // The merge output reached the transition's own output place.
    assert!(net.marking(0, done).await.unwrap().is_some());
    // The dispatch service answered with pre-dispatch and success tokens.
    assert!(net.marking(0, pre).await.unwrap().is_some());
    let success_token = net.marking(0, ok).await.unwrap().expect("success token");
    assert_eq!(net.marking(0, fail).await.unwrap(), None);

    let data = net.token(success_token).data().await.unwrap().unwrap();
    assert_eq!(data["job_id"], 777);
}

#[tokio::test]
async fn observers_hear_about_marked_places() {
    let harness = setup();
    let net = linear_net(harness.store.clone()).await;
    net.add_place_observer(1, "observer:linear").await.unwrap();

    harness
        .publish(
            &harness.routes.create_token,
            &Message::CreateToken {
                net_key: net.key().to_string(),
                place_idx: 0,
                color: 0,
                color_group_idx: 0,
                data: None,
            },
        )
        .await;
    harness.run().await;

    let observed = harness
        .store
        .lrange_all("observer:linear")
        .await
        .unwrap();
    assert_eq!(observed, vec!["0:1"]);
}

#[tokio::test]
async fn colors_flow_independently() {
    let harness = setup();
    let net = linear_net(harness.store.clone()).await;

    // Group 0 was created with one color; add a sibling group of one so
    // color 1 exists.
    let group = net.add_color_group(1, None, None).await.unwrap();
    assert_eq!(group.idx, 1);

    for (color, group_idx) in [(0u64, 0u64), (1u64, 1u64)] {
        harness
            .publish(
                &harness.routes.create_token,
                &Message::CreateToken {
                    net_key: net.key().to_string(),
                    place_idx: 0,
                    color,
                    color_group_idx: group_idx,
                    data: None,
                },
            )
            .await;
    }
    harness.run().await;

    // Each color fired its own copy of the transition.
    assert!(net.marking(0, 1).await.unwrap().is_some());
    assert!(net.marking(1, 1).await.unwrap().is_some());
    assert_eq!(
        net.transition(0).state(0).await.unwrap(),
        TransitionState::Fired
    );
    assert_eq!(
        net.transition(0).state(1).await.unwrap(),
        TransitionState::Fired
    );
    assert_eq!(net.group_marking(0, 1).await.unwrap(), 1);
    assert_eq!(net.group_marking(1, 1).await.unwrap(), 1);
}
