use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tradeback_agent::negotiation::PROPOSAL_MARKER;
use tradeback_agent::{ConversationRuntime, InboundOutcome, RuntimeDeps};
use tradeback_core::audit::NoopAuditSink;
use tradeback_core::config::{AlertsConfig, ExecutionConfig, NegotiationConfig, WorkersConfig};
use tradeback_core::domain::contact::ContactId;
use tradeback_core::domain::exchange::{ActionType, ExchangeId, ExchangeState, FulfillmentStatus};
use tradeback_core::domain::execution::{ActionRequest, ActionResponse, TaskStatus};
use tradeback_core::domain::message::{DeliveryFailure, FulfillmentConfirmation, InboundMessage};
use tradeback_core::domain::worker::{WorkerId, WorkerIdentity};
use tradeback_core::metrics::{AlertKind, InMemoryAlertSink, MetricsAggregator};
use tradeback_db::repositories::memory::{
    InMemoryContactRepository, InMemoryExchangeRepository, InMemoryExecutionTaskRepository,
    InMemoryWorkerRepository,
};
use tradeback_db::repositories::{ContactRepository, ExchangeRepository, ExecutionTaskRepository};
use tradeback_executor::{AutomationDriver, Orchestrator, OrchestratorDeps, OrchestratorHandle, PoolManager};
use tradeback_transport::InMemoryOutbox;

const WAIT: Duration = Duration::from_secs(5);
const CONTACT: &str = "creator-1";

enum Step {
    Respond(ActionResponse),
    After(Duration),
    Hang,
}

/// Scripted per action type; unscripted calls succeed. Records completion order.
#[derive(Default)]
struct ScriptedDriver {
    scripts: Mutex<HashMap<ActionType, VecDeque<Step>>>,
    finished: Mutex<Vec<ActionType>>,
}

impl ScriptedDriver {
    fn script(self, action_type: ActionType, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().insert(action_type, steps.into());
        self
    }

    fn finished(&self) -> Vec<ActionType> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl AutomationDriver for ScriptedDriver {
    async fn execute(&self, request: &ActionRequest) -> ActionResponse {
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.action_type)
            .and_then(|steps| steps.pop_front());
        let response = match step {
            Some(Step::Respond(response)) => response,
            Some(Step::After(delay)) => {
                tokio::time::sleep(delay).await;
                ActionResponse::success("done")
            }
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                ActionResponse::success("late")
            }
            None => ActionResponse::success("done"),
        };
        self.finished.lock().unwrap().push(request.action_type);
        response
    }
}

struct Harness {
    runtime: Arc<ConversationRuntime>,
    contacts: Arc<InMemoryContactRepository>,
    exchanges: Arc<InMemoryExchangeRepository>,
    tasks: Arc<InMemoryExecutionTaskRepository>,
    outbox: Arc<InMemoryOutbox>,
    alerts: Arc<InMemoryAlertSink>,
    driver: Arc<ScriptedDriver>,
}

fn execution_config() -> ExecutionConfig {
    ExecutionConfig {
        max_attempts: 3,
        task_timeout_ms: 100,
        jitter_min_ms: 0,
        jitter_max_ms: 0,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 40,
        requeue_delay_ms: 20,
        max_concurrent_tasks: 4,
        fulfillment_deadline_secs: 3_600,
        ..ExecutionConfig::default()
    }
}

async fn harness(negotiation: NegotiationConfig, driver: ScriptedDriver, workers: usize) -> Harness {
    let alerts = Arc::new(InMemoryAlertSink::default());
    let metrics = Arc::new(MetricsAggregator::new(AlertsConfig::default(), alerts.clone()));
    let pool = Arc::new(
        PoolManager::load(
            WorkersConfig::default(),
            Arc::new(InMemoryWorkerRepository::default()),
            metrics.clone(),
        )
        .await
        .expect("load pool"),
    );
    for index in 0..workers {
        pool.register(WorkerIdentity::new(WorkerId(format!("worker-{index}")), 100, Utc::now()))
            .await
            .expect("register worker");
    }

    let contacts = Arc::new(InMemoryContactRepository::default());
    let exchanges = Arc::new(InMemoryExchangeRepository::with_contacts(contacts.clone()));
    let tasks = Arc::new(InMemoryExecutionTaskRepository::default());
    let outbox = Arc::new(InMemoryOutbox::new());
    let driver = Arc::new(driver);
    let config = execution_config();
    let (handle, inbox) = OrchestratorHandle::new();

    let runtime = Arc::new(
        ConversationRuntime::new(
            &negotiation,
            &config,
            RuntimeDeps {
                contacts: contacts.clone(),
                exchanges: exchanges.clone(),
                tasks: tasks.clone(),
                outbound: outbox.clone(),
                handoff: Arc::new(handle),
                metrics: metrics.clone(),
                audit: Arc::new(NoopAuditSink),
            },
        )
        .expect("templates"),
    );

    let orchestrator = Orchestrator::new(
        &config,
        OrchestratorDeps {
            tasks: tasks.clone(),
            exchanges: exchanges.clone(),
            pool,
            driver: driver.clone(),
            reports: runtime.clone(),
            metrics,
        },
    );
    orchestrator.spawn(inbox);

    Harness { runtime, contacts, exchanges, tasks, outbox, alerts, driver }
}

fn inbound(text: &str) -> InboundMessage {
    InboundMessage {
        contact_id: ContactId(CONTACT.to_string()),
        display_name: Some("Robin".to_string()),
        raw_text: text.to_string(),
        received_at: Utc::now(),
    }
}

fn applied(outcome: InboundOutcome) -> (ExchangeId, ExchangeState) {
    match outcome {
        InboundOutcome::Applied { exchange_id, to, .. } => (exchange_id, to),
        other => panic!("expected an applied transition, got {other:?}"),
    }
}

impl Harness {
    async fn send(&self, text: &str) -> InboundOutcome {
        self.runtime.handle_inbound(inbound(text)).await.expect("inbound")
    }

    async fn initiate(&self) -> ExchangeId {
        let outcome = self
            .runtime
            .initiate(ContactId(CONTACT.to_string()), Some("Robin".to_string()))
            .await
            .expect("initiate");
        applied(outcome).0
    }

    /// Opening, interest and acceptance; returns the exchange once it is executing.
    async fn agree(&self) -> ExchangeId {
        let exchange_id = self.initiate().await;
        assert_eq!(applied(self.send("I'm interested").await).1, ExchangeState::Negotiating);
        assert_eq!(applied(self.send("deal").await).1, ExchangeState::Executing);
        exchange_id
    }

    async fn state(&self, exchange_id: &ExchangeId) -> ExchangeState {
        self.exchanges.find_by_id(exchange_id).await.expect("find").expect("exchange").state
    }

    async fn wait_for_state(&self, exchange_id: &ExchangeId, expected: ExchangeState) {
        let polled = tokio::time::timeout(WAIT, async {
            while self.state(exchange_id).await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "exchange never reached {expected:?}");
    }

    async fn wait_for_our_fulfillment(&self, exchange_id: &ExchangeId) {
        let polled = tokio::time::timeout(WAIT, async {
            loop {
                let exchange = self.exchanges.find_by_id(exchange_id).await.expect("find").expect("exchange");
                if exchange.our_fulfillment_status == FulfillmentStatus::Fulfilled {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "our side was never fulfilled");
    }

    async fn confirm(&self, exchange_id: &ExchangeId) -> Option<ExchangeState> {
        self.runtime
            .handle_confirmation(FulfillmentConfirmation {
                exchange_id: exchange_id.clone(),
                fulfilled: true,
                observed_at: Utc::now(),
            })
            .await
            .expect("confirmation")
    }

    fn sent(&self) -> Vec<String> {
        self.outbox.sent_to(CONTACT)
    }
}

#[tokio::test]
async fn interest_then_accept_agrees_and_schedules_one_task_per_offered_term() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 2).await;

    let exchange_id = harness.agree().await;

    let exchange = harness.exchanges.find_by_id(&exchange_id).await.unwrap().unwrap();
    assert!(exchange.agreed_at.is_some());
    assert!(exchange.fulfillment_deadline.is_some());
    assert_eq!(exchange.terms_offered.len(), 2);

    harness.wait_for_our_fulfillment(&exchange_id).await;
    let tasks = harness.tasks.list_for_exchange(&exchange_id).await.unwrap();
    assert_eq!(tasks.len(), exchange.terms_offered.len());
    assert!(tasks.iter().all(|task| task.status == TaskStatus::Succeeded));

    let sent = harness.sent();
    assert_eq!(sent.len(), 3, "opening, proposal, agreement confirmation");
    assert!(sent[0].contains(PROPOSAL_MARKER));

    let turns = harness.exchanges.list_turns(&exchange_id).await.unwrap();
    assert_eq!(turns.len(), 5, "three outbound and two inbound turns");
}

#[tokio::test]
async fn required_task_timing_out_every_attempt_fails_the_exchange() {
    let driver = ScriptedDriver::default()
        .script(ActionType::View, vec![Step::Hang, Step::Hang, Step::Hang]);
    let harness = harness(NegotiationConfig::default(), driver, 2).await;

    let exchange_id = harness.agree().await;
    harness.wait_for_state(&exchange_id, ExchangeState::Failed).await;

    let tasks = harness.tasks.list_for_exchange(&exchange_id).await.unwrap();
    let view = tasks.iter().find(|task| task.action_type == ActionType::View).expect("view task");
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.attempt_count, 3);

    let contact = harness.contacts.find_by_id(&ContactId(CONTACT.to_string())).await.unwrap().unwrap();
    assert_eq!(contact.failed_exchanges, 1);
    assert!(contact.cooldown_until.is_some());

    let exchange = harness.exchanges.find_by_id(&exchange_id).await.unwrap().unwrap();
    assert_eq!(exchange.our_fulfillment_status, FulfillmentStatus::Failed);
    assert_eq!(exchange.their_fulfillment_status, FulfillmentStatus::Unconfirmed);
}

#[tokio::test]
async fn exhausted_pool_leaves_tasks_pending_while_executing() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 0).await;

    let exchange_id = harness.agree().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(harness.state(&exchange_id).await, ExchangeState::Executing);
    let tasks = harness.tasks.list_for_exchange(&exchange_id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|task| task.status == TaskStatus::Pending));
    assert!(harness.driver.finished().is_empty());
}

#[tokio::test]
async fn blocking_mid_negotiation_is_immediate_and_silences_the_contact() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 1).await;
    let exchange_id = harness.initiate().await;
    harness.send("I'm interested").await;
    let sent_before = harness.sent().len();

    harness.runtime.block_contact(&ContactId(CONTACT.to_string())).await.expect("block");

    assert_eq!(harness.state(&exchange_id).await, ExchangeState::Blocked);
    assert_eq!(harness.send("deal").await, InboundOutcome::Ignored);
    assert_eq!(harness.sent().len(), sent_before);

    let contact = harness.contacts.find_by_id(&ContactId(CONTACT.to_string())).await.unwrap().unwrap();
    assert!(contact.blocked);
}

#[tokio::test]
async fn severe_abuse_blocks_without_a_reply() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 1).await;
    let exchange_id = harness.initiate().await;
    let sent_before = harness.sent().len();

    let (_, state) = applied(harness.send("you stupid scammer, shut up").await);

    assert_eq!(state, ExchangeState::Blocked);
    assert_eq!(harness.state(&exchange_id).await, ExchangeState::Blocked);
    assert_eq!(harness.sent().len(), sent_before);
}

#[tokio::test]
async fn out_of_order_task_completion_still_completes_the_exchange() {
    let driver = ScriptedDriver::default()
        .script(ActionType::View, vec![Step::After(Duration::from_millis(200))]);
    let harness = harness(NegotiationConfig::default(), driver, 2).await;

    let exchange_id = harness.agree().await;
    harness.wait_for_our_fulfillment(&exchange_id).await;
    assert_eq!(harness.driver.finished(), vec![ActionType::Endorse, ActionType::View]);
    assert_eq!(harness.state(&exchange_id).await, ExchangeState::Executing);

    assert_eq!(harness.confirm(&exchange_id).await, Some(ExchangeState::Completed));

    let contact = harness.contacts.find_by_id(&ContactId(CONTACT.to_string())).await.unwrap().unwrap();
    assert_eq!(contact.completed_exchanges, 1);
    assert!(contact.reliability_score > NegotiationConfig::default().initial_reliability);
    assert_eq!(harness.sent().len(), 4, "completion notice follows the agreement");
}

#[tokio::test]
async fn confirmation_before_agreement_is_ignored() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 1).await;
    let exchange_id = harness.initiate().await;

    assert_eq!(harness.confirm(&exchange_id).await, Some(ExchangeState::Contacted));
    let exchange = harness.exchanges.find_by_id(&exchange_id).await.unwrap().unwrap();
    assert_eq!(exchange.their_fulfillment_status, FulfillmentStatus::Pending);
}

#[tokio::test]
async fn counters_past_the_round_limit_abandon_the_exchange() {
    let config = NegotiationConfig { max_rounds: 2, ..NegotiationConfig::default() };
    let harness = harness(config, ScriptedDriver::default(), 1).await;
    let exchange_id = harness.initiate().await;

    assert_eq!(applied(harness.send("how about 3 views").await).1, ExchangeState::Negotiating);
    let exchange = harness.exchanges.find_by_id(&exchange_id).await.unwrap().unwrap();
    assert_eq!(exchange.negotiation_round, 1);
    assert_eq!(exchange.terms_offered.len(), 1);
    assert_eq!(exchange.terms_offered[0].quantity, 3);

    harness.send("what about 2 views").await;
    let (_, state) = applied(harness.send("how about 1 view instead").await);

    assert_eq!(state, ExchangeState::Abandoned);
    let last = harness.sent().last().cloned().expect("abandon notice");
    assert!(!last.contains(PROPOSAL_MARKER));
}

#[tokio::test]
async fn accept_restating_other_numbers_gets_the_proposal_again() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 1).await;
    let exchange_id = harness.initiate().await;
    harness.send("how about 3 views").await;
    let sent_before = harness.sent().len();

    let outcome = harness.send("deal, 5 views").await;

    assert_eq!(outcome, InboundOutcome::TermsRestated { exchange_id: exchange_id.clone() });
    assert_eq!(harness.state(&exchange_id).await, ExchangeState::Negotiating);
    assert_eq!(harness.sent().len(), sent_before + 1);
    assert!(harness.sent().last().unwrap().contains(PROPOSAL_MARKER));

    assert_eq!(applied(harness.send("ok").await).1, ExchangeState::Executing);
}

#[tokio::test]
async fn missed_deadline_fails_and_cooldown_refuses_the_next_exchange() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 2).await;
    let exchange_id = harness.agree().await;
    harness.wait_for_our_fulfillment(&exchange_id).await;

    let early = harness.runtime.sweep_deadlines(Utc::now()).await.expect("sweep");
    assert_eq!(early, 0);

    let late = Utc::now() + chrono::Duration::seconds(3_601);
    let failed = harness.runtime.sweep_deadlines(late).await.expect("sweep");
    assert_eq!(failed, 1);
    assert_eq!(harness.state(&exchange_id).await, ExchangeState::Failed);

    let again = harness.runtime.initiate(ContactId(CONTACT.to_string()), None).await.expect("initiate");
    assert_eq!(again, InboundOutcome::Refused);
}

#[tokio::test]
async fn operator_cancel_abandons_and_notifies() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 1).await;
    let exchange_id = harness.initiate().await;
    harness.send("I'm interested").await;
    let sent_before = harness.sent().len();

    let state = harness.runtime.cancel(&exchange_id).await.expect("cancel");

    assert_eq!(state, ExchangeState::Abandoned);
    assert_eq!(harness.sent().len(), sent_before + 1);
    assert_eq!(harness.runtime.cancel(&exchange_id).await.ok(), None);
}

#[tokio::test]
async fn failure_reports_resend_once_each_within_the_attempt_budget() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 1).await;
    harness.outbox.fail_next("socket closed");

    let exchange_id = harness.initiate().await;
    assert_eq!(harness.outbox.attempts(), 1, "the runtime sends once; the transport owns backoff");
    assert!(harness.sent().is_empty());

    let turns = harness.exchanges.list_turns(&exchange_id).await.unwrap();
    let opening = turns[0].raw_text.clone();
    let failure = |attempt: u32| DeliveryFailure {
        contact_id: ContactId(CONTACT.to_string()),
        text: opening.clone(),
        attempt,
        reason: "socket closed".to_string(),
    };

    harness.outbox.fail_next("socket closed");
    assert!(!harness.runtime.handle_undelivered(failure(1)).await.expect("resend"));
    assert_eq!(harness.outbox.attempts(), 2);

    assert!(harness.runtime.handle_undelivered(failure(2)).await.expect("resend"));
    assert_eq!(harness.outbox.attempts(), 3);
    assert_eq!(harness.sent(), vec![opening.clone()]);

    assert!(!harness.runtime.handle_undelivered(failure(3)).await.expect("budget used up"));
    assert_eq!(harness.outbox.attempts(), 3);
    assert_eq!(harness.alerts.count(AlertKind::PersistenceUnavailable), 0);
}

#[tokio::test]
async fn contact_writing_first_reaches_agreement_on_interest_then_accept() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 2).await;

    let InboundOutcome::Applied { exchange_id, from, to } = harness.send("I'm interested").await else {
        panic!("the first message should open an exchange");
    };
    assert_eq!((from, to), (ExchangeState::Init, ExchangeState::Negotiating));

    assert_eq!(applied(harness.send("deal").await), (exchange_id.clone(), ExchangeState::Executing));
    let exchange = harness.exchanges.find_by_id(&exchange_id).await.unwrap().unwrap();
    assert!(exchange.agreed_at.is_some());
    assert!(exchange.fulfillment_deadline.is_some());

    harness.wait_for_our_fulfillment(&exchange_id).await;
    let tasks = harness.tasks.list_for_exchange(&exchange_id).await.unwrap();
    assert_eq!(tasks.len(), exchange.terms_offered.len());

    let sent = harness.sent();
    assert_eq!(sent.len(), 2, "proposal and agreement confirmation, no separate opening");
    assert!(sent[0].contains(PROPOSAL_MARKER));
    let turns = harness.exchanges.list_turns(&exchange_id).await.unwrap();
    assert_eq!(turns.len(), 4);
}

#[tokio::test]
async fn contact_asking_first_gets_the_opening() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 1).await;

    let (_, state) = applied(harness.send("what is this about?").await);

    assert_eq!(state, ExchangeState::Contacted);
    assert_eq!(harness.sent().len(), 1);
}

#[tokio::test]
async fn confirmation_observed_after_the_deadline_fails_the_exchange() {
    let harness = harness(NegotiationConfig::default(), ScriptedDriver::default(), 2).await;
    let exchange_id = harness.agree().await;
    harness.wait_for_our_fulfillment(&exchange_id).await;
    let deadline = harness
        .exchanges
        .find_by_id(&exchange_id)
        .await
        .unwrap()
        .unwrap()
        .fulfillment_deadline
        .expect("deadline");

    let state = harness
        .runtime
        .handle_confirmation(FulfillmentConfirmation {
            exchange_id: exchange_id.clone(),
            fulfilled: true,
            observed_at: deadline + chrono::Duration::hours(1),
        })
        .await
        .expect("confirmation");

    assert_eq!(state, Some(ExchangeState::Failed));
    assert_eq!(harness.state(&exchange_id).await, ExchangeState::Failed);
    let contact = harness.contacts.find_by_id(&ContactId(CONTACT.to_string())).await.unwrap().unwrap();
    assert_eq!(contact.failed_exchanges, 1);
    assert_eq!(contact.completed_exchanges, 0);
}
