use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stocktake_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId, UserId};
use stocktake_events::{Command, Event};

use crate::Quantity;
use crate::assignment::CountingAssignment;
use crate::error::{CountingError, MIN_OVERRIDE_NOTES_LEN};
use crate::ids::{CountNumber, CountableItemId, SessionId};
use crate::item::{
    CountEntry, CountableItem, FlagReason, NewCountableItem, ResolutionMethod, ResolutionRecord,
};
use crate::reconcile::{self, Inputs, Outcome, ReconciliationPolicy, Resolution};
use crate::scope::CountingScope;
use crate::status::{ExecutionMode, SessionStatus};

/// Aggregate root: CountingSession.
///
/// Owns the item set (frozen at activation), the counters' assignments and
/// every count entry and resolution. All of it changes through events only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountingSession {
    id: SessionId,
    tenant_id: Option<TenantId>,
    share_id: Uuid,
    scope: CountingScope,
    execution_mode: ExecutionMode,
    requires_count_2: bool,
    requires_count_3: bool,
    allow_unexpected_items: bool,
    count_1_user: Option<UserId>,
    count_2_user: Option<UserId>,
    count_3_user: Option<UserId>,
    policy: ReconciliationPolicy,
    created_by: Option<UserId>,

    status: SessionStatus,
    scheduled_start: Option<DateTime<Utc>>,
    scheduled_end: Option<DateTime<Utc>>,
    instructions: Option<String>,
    created_at: Option<DateTime<Utc>>,
    activated_at: Option<DateTime<Utc>>,
    finalized_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,

    items: Vec<CountableItem>,
    item_index: HashMap<CountableItemId, usize>,
    assignments: Vec<CountingAssignment>,
    third_count_rounds: u32,

    version: u64,
    created: bool,
}

impl CountingSession {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: SessionId) -> Self {
        Self {
            id,
            tenant_id: None,
            share_id: Uuid::nil(),
            scope: CountingScope::FullInventory,
            execution_mode: ExecutionMode::Parallel,
            requires_count_2: false,
            requires_count_3: false,
            allow_unexpected_items: false,
            count_1_user: None,
            count_2_user: None,
            count_3_user: None,
            policy: ReconciliationPolicy::default(),
            created_by: None,
            status: SessionStatus::Draft,
            scheduled_start: None,
            scheduled_end: None,
            instructions: None,
            created_at: None,
            activated_at: None,
            finalized_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            items: Vec::new(),
            item_index: HashMap::new(),
            assignments: Vec::new(),
            third_count_rounds: 0,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SessionId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// Externally shareable identifier (links handed to counters).
    pub fn share_id(&self) -> Uuid {
        self.share_id
    }

    pub fn scope(&self) -> &CountingScope {
        &self.scope
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn requires_count_2(&self) -> bool {
        self.requires_count_2
    }

    pub fn requires_count_3(&self) -> bool {
        self.requires_count_3
    }

    pub fn allow_unexpected_items(&self) -> bool {
        self.allow_unexpected_items
    }

    pub fn counter(&self, count: CountNumber) -> Option<UserId> {
        match count {
            CountNumber::First => self.count_1_user,
            CountNumber::Second => self.count_2_user,
            CountNumber::Third => self.count_3_user,
        }
    }

    pub fn policy(&self) -> &ReconciliationPolicy {
        &self.policy
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn scheduled_start(&self) -> Option<DateTime<Utc>> {
        self.scheduled_start
    }

    pub fn scheduled_end(&self) -> Option<DateTime<Utc>> {
        self.scheduled_end
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.activated_at
    }

    pub fn finalized_at(&self) -> Option<DateTime<Utc>> {
        self.finalized_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn items(&self) -> &[CountableItem] {
        &self.items
    }

    pub fn item(&self, id: CountableItemId) -> Option<&CountableItem> {
        self.item_index.get(&id).and_then(|&idx| self.items.get(idx))
    }

    pub fn assignments(&self) -> &[CountingAssignment] {
        &self.assignments
    }

    /// Number of third-count rounds triggered so far.
    pub fn third_count_rounds(&self) -> u32 {
        self.third_count_rounds
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Whether entries for `count` are currently accepted.
    pub fn is_phase_open(&self, count: CountNumber) -> bool {
        match self.status {
            SessionStatus::Count1InProgress => match count {
                CountNumber::First => true,
                CountNumber::Second => {
                    self.requires_count_2 && self.execution_mode == ExecutionMode::Parallel
                }
                CountNumber::Third => false,
            },
            SessionStatus::Count2InProgress => count == CountNumber::Second,
            SessionStatus::Count3InProgress => count == CountNumber::Third,
            _ => false,
        }
    }

    /// The assignment is the current write authority for its count number.
    pub fn is_assignment_active(&self, assignment: &CountingAssignment) -> bool {
        self.is_phase_open(assignment.count_number)
            && (assignment.count_number != CountNumber::Third
                || assignment.round == self.third_count_rounds)
    }

    /// The counter's currently writable assignment, if any.
    pub fn active_assignment_for(&self, counter: UserId) -> Option<&CountingAssignment> {
        self.assignments
            .iter()
            .rev()
            .find(|a| a.counter == counter && self.is_assignment_active(a))
    }

    /// Most recent assignment of the counter, writable or not.
    pub fn latest_assignment_for(&self, counter: UserId) -> Option<&CountingAssignment> {
        self.assignments.iter().rev().find(|a| a.counter == counter)
    }

    pub fn covers(&self, assignment: &CountingAssignment, item: &CountableItem) -> bool {
        match assignment.count_number {
            CountNumber::First | CountNumber::Second => true,
            CountNumber::Third => item.third_count_round() == Some(assignment.round),
        }
    }

    pub fn assignment_items<'a>(
        &'a self,
        assignment: &'a CountingAssignment,
    ) -> impl Iterator<Item = &'a CountableItem> + 'a {
        self.items
            .iter()
            .filter(move |item| self.covers(assignment, item))
    }

    /// `(total_items, counted_items)` for an assignment.
    pub fn assignment_progress(&self, assignment: &CountingAssignment) -> (usize, usize) {
        self.assignment_items(assignment)
            .fold((0, 0), |(total, counted), item| {
                let done = item.entry(assignment.count_number).is_some();
                (total + 1, counted + usize::from(done))
            })
    }

    /// Pending items whose first two counts disagree.
    pub fn third_count_candidates(&self) -> Vec<CountableItemId> {
        self.items
            .iter()
            .filter(|i| i.is_third_count_candidate())
            .map(|i| i.item_id())
            .collect()
    }

    /// Ids of every `pending` item, sorted.
    pub fn unresolved_item_ids(&self) -> Vec<CountableItemId> {
        let mut ids: Vec<CountableItemId> = self
            .items
            .iter()
            .filter(|i| i.is_pending())
            .map(|i| i.item_id())
            .collect();
        ids.sort();
        ids
    }

    fn phase_complete(&self, count: CountNumber) -> bool {
        let mut current = self
            .assignments
            .iter()
            .filter(|a| {
                a.count_number == count
                    && (count != CountNumber::Third || a.round == self.third_count_rounds)
            })
            .peekable();
        current.peek().is_some() && current.all(|a| a.is_completed())
    }

    fn insert_item(&mut self, item: CountableItem) {
        self.item_index.insert(item.item_id(), self.items.len());
        self.items.push(item);
    }

    fn item_mut(&mut self, id: CountableItemId) -> Option<&mut CountableItem> {
        let idx = *self.item_index.get(&id)?;
        self.items.get_mut(idx)
    }

    fn assignment_mut(
        &mut self,
        counter: UserId,
        count: CountNumber,
        round: u32,
    ) -> Option<&mut CountingAssignment> {
        self.assignments
            .iter_mut()
            .find(|a| a.counter == counter && a.count_number == count && a.round == round)
    }
}

impl AggregateRoot for CountingSession {
    type Id = SessionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// -------------------------
// Commands
// -------------------------

/// Command: CreateSession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSession {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub share_id: Uuid,
    pub scope: CountingScope,
    pub execution_mode: ExecutionMode,
    pub requires_count_2: bool,
    pub requires_count_3: bool,
    pub allow_unexpected_items: bool,
    pub count_1_user: Option<UserId>,
    pub count_2_user: Option<UserId>,
    pub count_3_user: Option<UserId>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub instructions: Option<String>,
    pub policy: ReconciliationPolicy,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ScheduleSession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSession {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ActivateSession. `items` is the scope resolved at activation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateSession {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub items: Vec<NewCountableItem>,
    pub activated_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCount {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub item_id: CountableItemId,
    pub counter: UserId,
    pub quantity: Quantity,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RegisterUnexpectedItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUnexpectedItem {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub counter: UserId,
    pub item: NewCountableItem,
    pub quantity: Quantity,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TriggerThirdCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerThirdCount {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub item_ids: Vec<CountableItemId>,
    pub deadline: Option<DateTime<Utc>>,
    pub triggered_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitForReview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitForReview {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub submitted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ManualOverride.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub item_id: CountableItemId,
    pub quantity: Quantity,
    pub notes: String,
    pub decided_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelSession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSession {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub reason: String,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FinalizeSession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeSession {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub finalized_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountingCommand {
    CreateSession(CreateSession),
    ScheduleSession(ScheduleSession),
    ActivateSession(ActivateSession),
    SubmitCount(SubmitCount),
    RegisterUnexpectedItem(RegisterUnexpectedItem),
    TriggerThirdCount(TriggerThirdCount),
    SubmitForReview(SubmitForReview),
    ManualOverride(ManualOverride),
    CancelSession(CancelSession),
    FinalizeSession(FinalizeSession),
}

impl CountingCommand {
    pub fn session_id(&self) -> SessionId {
        match self {
            CountingCommand::CreateSession(c) => c.session_id,
            CountingCommand::ScheduleSession(c) => c.session_id,
            CountingCommand::ActivateSession(c) => c.session_id,
            CountingCommand::SubmitCount(c) => c.session_id,
            CountingCommand::RegisterUnexpectedItem(c) => c.session_id,
            CountingCommand::TriggerThirdCount(c) => c.session_id,
            CountingCommand::SubmitForReview(c) => c.session_id,
            CountingCommand::ManualOverride(c) => c.session_id,
            CountingCommand::CancelSession(c) => c.session_id,
            CountingCommand::FinalizeSession(c) => c.session_id,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        match self {
            CountingCommand::CreateSession(c) => c.tenant_id,
            CountingCommand::ScheduleSession(c) => c.tenant_id,
            CountingCommand::ActivateSession(c) => c.tenant_id,
            CountingCommand::SubmitCount(c) => c.tenant_id,
            CountingCommand::RegisterUnexpectedItem(c) => c.tenant_id,
            CountingCommand::TriggerThirdCount(c) => c.tenant_id,
            CountingCommand::SubmitForReview(c) => c.tenant_id,
            CountingCommand::ManualOverride(c) => c.tenant_id,
            CountingCommand::CancelSession(c) => c.tenant_id,
            CountingCommand::FinalizeSession(c) => c.tenant_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CountingCommand::CreateSession(_) => "create_session",
            CountingCommand::ScheduleSession(_) => "schedule_session",
            CountingCommand::ActivateSession(_) => "activate_session",
            CountingCommand::SubmitCount(_) => "submit_count",
            CountingCommand::RegisterUnexpectedItem(_) => "register_unexpected_item",
            CountingCommand::TriggerThirdCount(_) => "trigger_third_count",
            CountingCommand::SubmitForReview(_) => "submit_for_review",
            CountingCommand::ManualOverride(_) => "manual_override",
            CountingCommand::CancelSession(_) => "cancel_session",
            CountingCommand::FinalizeSession(_) => "finalize_session",
        }
    }
}

impl Command for CountingCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.session_id().0
    }
}

// -------------------------
// Events
// -------------------------

/// Event: SessionCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub share_id: Uuid,
    pub scope: CountingScope,
    pub execution_mode: ExecutionMode,
    pub requires_count_2: bool,
    pub requires_count_3: bool,
    pub allow_unexpected_items: bool,
    pub count_1_user: UserId,
    pub count_2_user: Option<UserId>,
    pub count_3_user: Option<UserId>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub instructions: Option<String>,
    pub policy: ReconciliationPolicy,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SessionScheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionScheduled {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SessionActivated. Carries the frozen item snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionActivated {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub items: Vec<NewCountableItem>,
    pub activated_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AssignmentOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentOpened {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub counter: UserId,
    pub count_number: CountNumber,
    pub round: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSubmitted {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub item_id: CountableItemId,
    pub count_number: CountNumber,
    pub round: u32,
    pub counter: UserId,
    pub quantity: Quantity,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnexpectedItemRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnexpectedItemRegistered {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub item: NewCountableItem,
    pub counter: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AssignmentCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentCompleted {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub counter: UserId,
    pub count_number: CountNumber,
    pub round: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusChanged (phase transitions other than activate/cancel/finalize).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemFlagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFlagged {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub item_id: CountableItemId,
    pub reason: FlagReason,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemResolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResolved {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub item_id: CountableItemId,
    pub method: ResolutionMethod,
    pub final_qty: Quantity,
    pub variance: Quantity,
    pub variance_percentage: Option<Quantity>,
    pub notes: Option<String>,
    pub flag: Option<FlagReason>,
    /// `None` for engine resolutions.
    pub resolved_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ThirdCountTriggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdCountTriggered {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub round: u32,
    pub item_ids: Vec<CountableItemId>,
    pub counter: UserId,
    pub deadline: Option<DateTime<Utc>>,
    pub triggered_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SessionCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCancelled {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub from: SessionStatus,
    pub reason: String,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SessionFinalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFinalized {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub finalized_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountingEvent {
    SessionCreated(SessionCreated),
    SessionScheduled(SessionScheduled),
    SessionActivated(SessionActivated),
    AssignmentOpened(AssignmentOpened),
    CountSubmitted(CountSubmitted),
    UnexpectedItemRegistered(UnexpectedItemRegistered),
    AssignmentCompleted(AssignmentCompleted),
    StatusChanged(StatusChanged),
    ItemFlagged(ItemFlagged),
    ItemResolved(ItemResolved),
    ThirdCountTriggered(ThirdCountTriggered),
    SessionCancelled(SessionCancelled),
    SessionFinalized(SessionFinalized),
}

macro_rules! each_event {
    ($self:expr, $e:ident => $body:expr) => {
        match $self {
            CountingEvent::SessionCreated($e) => $body,
            CountingEvent::SessionScheduled($e) => $body,
            CountingEvent::SessionActivated($e) => $body,
            CountingEvent::AssignmentOpened($e) => $body,
            CountingEvent::CountSubmitted($e) => $body,
            CountingEvent::UnexpectedItemRegistered($e) => $body,
            CountingEvent::AssignmentCompleted($e) => $body,
            CountingEvent::StatusChanged($e) => $body,
            CountingEvent::ItemFlagged($e) => $body,
            CountingEvent::ItemResolved($e) => $body,
            CountingEvent::ThirdCountTriggered($e) => $body,
            CountingEvent::SessionCancelled($e) => $body,
            CountingEvent::SessionFinalized($e) => $body,
        }
    };
}

impl CountingEvent {
    pub fn session_id(&self) -> SessionId {
        each_event!(self, e => e.session_id)
    }

    pub fn tenant_id(&self) -> TenantId {
        each_event!(self, e => e.tenant_id)
    }
}

impl Event for CountingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CountingEvent::SessionCreated(_) => "counting.session.created",
            CountingEvent::SessionScheduled(_) => "counting.session.scheduled",
            CountingEvent::SessionActivated(_) => "counting.session.activated",
            CountingEvent::AssignmentOpened(_) => "counting.assignment.opened",
            CountingEvent::CountSubmitted(_) => "counting.count.submitted",
            CountingEvent::UnexpectedItemRegistered(_) => "counting.item.unexpected_registered",
            CountingEvent::AssignmentCompleted(_) => "counting.assignment.completed",
            CountingEvent::StatusChanged(_) => "counting.session.status_changed",
            CountingEvent::ItemFlagged(_) => "counting.item.flagged",
            CountingEvent::ItemResolved(_) => "counting.item.resolved",
            CountingEvent::ThirdCountTriggered(_) => "counting.third_count.triggered",
            CountingEvent::SessionCancelled(_) => "counting.session.cancelled",
            CountingEvent::SessionFinalized(_) => "counting.session.finalized",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        each_event!(self, e => e.occurred_at)
    }
}

// -------------------------
// Aggregate
// -------------------------

impl Aggregate for CountingSession {
    type Command = CountingCommand;
    type Event = CountingEvent;
    type Error = CountingError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CountingEvent::SessionCreated(e) => {
                self.id = e.session_id;
                self.tenant_id = Some(e.tenant_id);
                self.share_id = e.share_id;
                self.scope = e.scope.clone();
                self.execution_mode = e.execution_mode;
                self.requires_count_2 = e.requires_count_2;
                self.requires_count_3 = e.requires_count_3;
                self.allow_unexpected_items = e.allow_unexpected_items;
                self.count_1_user = Some(e.count_1_user);
                self.count_2_user = e.count_2_user;
                self.count_3_user = e.count_3_user;
                self.policy = e.policy;
                self.created_by = Some(e.created_by);
                self.status = SessionStatus::Draft;
                self.scheduled_start = e.scheduled_start;
                self.scheduled_end = e.scheduled_end;
                self.instructions = e.instructions.clone();
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            CountingEvent::SessionScheduled(e) => {
                self.status = SessionStatus::Scheduled;
                self.scheduled_start = Some(e.scheduled_start);
                if e.scheduled_end.is_some() {
                    self.scheduled_end = e.scheduled_end;
                }
            }
            CountingEvent::SessionActivated(e) => {
                self.items.clear();
                self.item_index.clear();
                for new in &e.items {
                    self.insert_item(CountableItem::materialize(new, false));
                }
                self.status = SessionStatus::Count1InProgress;
                self.activated_at = Some(e.occurred_at);
            }
            CountingEvent::AssignmentOpened(e) => {
                self.assignments.push(CountingAssignment::open(
                    e.counter,
                    e.count_number,
                    e.round,
                    e.occurred_at,
                    e.deadline,
                ));
            }
            CountingEvent::CountSubmitted(e) => {
                if let Some(item) = self.item_mut(e.item_id) {
                    item.record_entry(
                        e.count_number,
                        CountEntry {
                            quantity: e.quantity,
                            submitted_at: e.occurred_at,
                            notes: e.notes.clone(),
                            submitted_by: e.counter,
                        },
                    );
                }
                if let Some(a) = self.assignment_mut(e.counter, e.count_number, e.round) {
                    a.mark_started(e.occurred_at);
                }
            }
            CountingEvent::UnexpectedItemRegistered(e) => {
                self.insert_item(CountableItem::materialize(&e.item, true));
                for a in self
                    .assignments
                    .iter_mut()
                    .filter(|a| a.count_number != CountNumber::Third)
                {
                    a.reopen();
                }
            }
            CountingEvent::AssignmentCompleted(e) => {
                if let Some(a) = self.assignment_mut(e.counter, e.count_number, e.round) {
                    a.mark_completed(e.occurred_at);
                }
            }
            CountingEvent::StatusChanged(e) => {
                self.status = e.to;
            }
            CountingEvent::ItemFlagged(e) => {
                if let Some(item) = self.item_mut(e.item_id) {
                    item.flag(e.reason);
                }
            }
            CountingEvent::ItemResolved(e) => {
                if let Some(item) = self.item_mut(e.item_id) {
                    item.resolve(
                        ResolutionRecord {
                            method: e.method,
                            final_qty: e.final_qty,
                            variance: e.variance,
                            notes: e.notes.clone(),
                            decided_by: e.resolved_by,
                            decided_at: e.occurred_at,
                        },
                        e.variance_percentage,
                        e.flag,
                    );
                }
            }
            CountingEvent::ThirdCountTriggered(e) => {
                self.third_count_rounds = e.round;
                for id in &e.item_ids {
                    if let Some(item) = self.item_mut(*id) {
                        item.enter_third_round(e.round);
                    }
                }
            }
            CountingEvent::SessionCancelled(e) => {
                self.status = SessionStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
                self.cancellation_reason = Some(e.reason.clone());
            }
            CountingEvent::SessionFinalized(e) => {
                self.status = SessionStatus::Finalized;
                self.finalized_at = Some(e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CountingCommand::CreateSession(cmd) => self.handle_create(cmd),
            CountingCommand::ScheduleSession(cmd) => self.handle_schedule(cmd),
            CountingCommand::ActivateSession(cmd) => self.handle_activate(cmd),
            CountingCommand::SubmitCount(cmd) => self.handle_submit(cmd),
            CountingCommand::RegisterUnexpectedItem(cmd) => self.handle_register_unexpected(cmd),
            CountingCommand::TriggerThirdCount(cmd) => self.handle_trigger_third_count(cmd),
            CountingCommand::SubmitForReview(cmd) => self.handle_submit_for_review(cmd),
            CountingCommand::ManualOverride(cmd) => self.handle_manual_override(cmd),
            CountingCommand::CancelSession(cmd) => self.handle_cancel(cmd),
            CountingCommand::FinalizeSession(cmd) => self.handle_finalize(cmd),
        }
    }
}

/// Common event metadata for one command.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    tenant_id: TenantId,
    session_id: SessionId,
    occurred_at: DateTime<Utc>,
}

/// Events decided by one command, applied to a scratch copy as they are
/// emitted so later decisions in the same command see earlier ones.
struct Batch {
    state: CountingSession,
    events: Vec<CountingEvent>,
    stamp: Stamp,
}

impl Batch {
    fn new(session: &CountingSession, stamp: Stamp) -> Self {
        Self {
            state: session.clone(),
            events: Vec::new(),
            stamp,
        }
    }

    fn emit(&mut self, event: CountingEvent) {
        self.state.apply(&event);
        self.events.push(event);
    }

    fn finish(self) -> Vec<CountingEvent> {
        self.events
    }

    fn transition(&mut self, to: SessionStatus) -> Result<(), CountingError> {
        let from = self.state.status;
        from.ensure_transition(to)?;
        let s = self.stamp;
        self.emit(CountingEvent::StatusChanged(StatusChanged {
            tenant_id: s.tenant_id,
            session_id: s.session_id,
            from,
            to,
            occurred_at: s.occurred_at,
        }));
        Ok(())
    }

    fn open_assignment(
        &mut self,
        counter: UserId,
        count_number: CountNumber,
        round: u32,
        deadline: Option<DateTime<Utc>>,
    ) {
        let s = self.stamp;
        self.emit(CountingEvent::AssignmentOpened(AssignmentOpened {
            tenant_id: s.tenant_id,
            session_id: s.session_id,
            counter,
            count_number,
            round,
            deadline,
            occurred_at: s.occurred_at,
        }));
    }

    fn submit(
        &mut self,
        item_id: CountableItemId,
        assignment: (UserId, CountNumber, u32),
        quantity: Quantity,
        notes: Option<String>,
    ) {
        let (counter, count_number, round) = assignment;
        let s = self.stamp;
        self.emit(CountingEvent::CountSubmitted(CountSubmitted {
            tenant_id: s.tenant_id,
            session_id: s.session_id,
            item_id,
            count_number,
            round,
            counter,
            quantity,
            notes,
            occurred_at: s.occurred_at,
        }));
    }

    fn resolve(
        &mut self,
        item_id: CountableItemId,
        resolution: Resolution,
        resolved_by: Option<UserId>,
    ) -> Result<(), CountingError> {
        let current = self
            .state
            .item(item_id)
            .map(|item| item.resolution_method())
            .ok_or(CountingError::ItemNotInScope(item_id))?;
        if !current.may_be_replaced_by(resolution.method) {
            return Err(CountingError::EntryLocked(item_id));
        }
        let s = self.stamp;
        self.emit(CountingEvent::ItemResolved(ItemResolved {
            tenant_id: s.tenant_id,
            session_id: s.session_id,
            item_id,
            method: resolution.method,
            final_qty: resolution.final_qty,
            variance: resolution.variance,
            variance_percentage: resolution.variance_percentage,
            notes: resolution.notes,
            flag: resolution.flag,
            resolved_by,
            occurred_at: s.occurred_at,
        }));
        Ok(())
    }

    /// Run the engine for one item; no-op unless the item is still pending.
    fn reconcile_item(&mut self, item_id: CountableItemId) -> Result<(), CountingError> {
        let (outcome, current_flag) = {
            let Some(item) = self.state.item(item_id) else {
                return Ok(());
            };
            if !item.is_pending() {
                return Ok(());
            }
            let inputs = Inputs {
                theoretical: item.theoretical_qty(),
                count_1: item.entry(CountNumber::First).map(|e| e.quantity),
                count_2: item.entry(CountNumber::Second).map(|e| e.quantity),
                count_3: item.entry(CountNumber::Third).map(|e| e.quantity),
                requires_count_2: self.state.requires_count_2,
                in_third_round: item.third_count_round().is_some(),
            };
            (
                reconcile::evaluate(&self.state.policy, &inputs),
                item.flag_reason(),
            )
        };

        match outcome {
            Outcome::Waiting => Ok(()),
            Outcome::Unresolved(reason) => {
                if current_flag != Some(reason) {
                    let s = self.stamp;
                    self.emit(CountingEvent::ItemFlagged(ItemFlagged {
                        tenant_id: s.tenant_id,
                        session_id: s.session_id,
                        item_id,
                        reason,
                        occurred_at: s.occurred_at,
                    }));
                }
                Ok(())
            }
            Outcome::Resolved(resolution) => self.resolve(item_id, resolution, None),
        }
    }

    /// Bulk pass over every pending item (phase completion).
    fn sweep(&mut self) -> Result<(), CountingError> {
        for id in self.state.unresolved_item_ids() {
            self.reconcile_item(id)?;
        }
        Ok(())
    }

    fn complete_assignments(&mut self) {
        let done: Vec<(UserId, CountNumber, u32)> = self
            .state
            .assignments
            .iter()
            .filter(|a| !a.is_completed() && self.state.is_assignment_active(a))
            .filter(|a| {
                self.state
                    .assignment_items(a)
                    .all(|item| item.entry(a.count_number).is_some())
            })
            .map(|a| (a.counter, a.count_number, a.round))
            .collect();

        let s = self.stamp;
        for (counter, count_number, round) in done {
            self.emit(CountingEvent::AssignmentCompleted(AssignmentCompleted {
                tenant_id: s.tenant_id,
                session_id: s.session_id,
                counter,
                count_number,
                round,
                occurred_at: s.occurred_at,
            }));
        }
    }

    /// Fire every phase transition the current state allows, in order.
    fn advance(&mut self) -> Result<(), CountingError> {
        loop {
            self.complete_assignments();

            let status = self.state.status;
            let next = match status {
                SessionStatus::Count1InProgress
                    if self.state.phase_complete(CountNumber::First) =>
                {
                    Some(SessionStatus::Count1Completed)
                }
                SessionStatus::Count1Completed => {
                    if self.state.requires_count_2 {
                        Some(SessionStatus::Count2InProgress)
                    } else {
                        self.sweep()?;
                        Some(SessionStatus::PendingReview)
                    }
                }
                SessionStatus::Count2InProgress
                    if self.state.phase_complete(CountNumber::Second) =>
                {
                    Some(SessionStatus::Count2Completed)
                }
                SessionStatus::Count2Completed => {
                    self.sweep()?;
                    if self.state.requires_count_3
                        && !self.state.third_count_candidates().is_empty()
                    {
                        // Supervisor decides: trigger a third count or submit for review.
                        None
                    } else {
                        Some(SessionStatus::PendingReview)
                    }
                }
                SessionStatus::Count3InProgress
                    if self.state.phase_complete(CountNumber::Third) =>
                {
                    Some(SessionStatus::Count3Completed)
                }
                SessionStatus::Count3Completed => {
                    self.sweep()?;
                    Some(SessionStatus::PendingReview)
                }
                _ => None,
            };

            let Some(to) = next else {
                return Ok(());
            };
            self.transition(to)?;

            if to == SessionStatus::Count2InProgress
                && self.state.execution_mode == ExecutionMode::Sequential
            {
                let counter = self
                    .state
                    .count_2_user
                    .ok_or_else(|| DomainError::invariant("count_2_user missing"))?;
                let deadline = self.state.scheduled_end;
                self.open_assignment(counter, CountNumber::Second, 1, deadline);
            }
        }
    }
}

impl CountingSession {
    fn ensure_target(&self, tenant_id: TenantId, session_id: SessionId) -> Result<(), CountingError> {
        if !self.created {
            return Err(CountingError::NotFound);
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch").into());
        }
        if self.id != session_id {
            return Err(DomainError::invariant("session_id mismatch").into());
        }
        Ok(())
    }

    fn ensure_not_terminal(&self) -> Result<(), CountingError> {
        match self.status {
            SessionStatus::Cancelled => Err(CountingError::SessionCancelled),
            SessionStatus::Finalized => Err(CountingError::SessionFinalized),
            _ => Ok(()),
        }
    }

    fn ensure_quantity(quantity: Quantity) -> Result<(), CountingError> {
        if quantity < Quantity::ZERO {
            return Err(CountingError::InvalidQuantity(format!(
                "quantity must not be negative (got {quantity})"
            )));
        }
        Ok(())
    }

    fn stamp(&self, occurred_at: DateTime<Utc>) -> Result<Stamp, CountingError> {
        let tenant_id = self
            .tenant_id
            .ok_or_else(|| DomainError::invariant("session has no tenant"))?;
        Ok(Stamp {
            tenant_id,
            session_id: self.id,
            occurred_at,
        })
    }

    fn handle_create(&self, cmd: &CreateSession) -> Result<Vec<CountingEvent>, CountingError> {
        if self.created {
            return Err(DomainError::conflict("counting session already exists").into());
        }

        cmd.scope.validate()?;
        let allow_unexpected_items = match cmd.scope {
            CountingScope::FullInventory => true,
            _ if cmd.allow_unexpected_items => {
                return Err(CountingError::invalid_scope(
                    "allow_unexpected_items is only valid for full_inventory scope",
                ));
            }
            _ => false,
        };

        let Some(count_1_user) = cmd.count_1_user else {
            return Err(CountingError::validation("count_1_user is required"));
        };
        if cmd.requires_count_3 && !cmd.requires_count_2 {
            return Err(CountingError::validation(
                "requires_count_3 implies requires_count_2",
            ));
        }
        if cmd.requires_count_2 && cmd.count_2_user.is_none() {
            return Err(CountingError::validation(
                "count_2_user is required when requires_count_2 is set",
            ));
        }
        if cmd.requires_count_3 && cmd.count_3_user.is_none() {
            return Err(CountingError::validation(
                "count_3_user is required when requires_count_3 is set",
            ));
        }

        let assigned = [Some(count_1_user), cmd.count_2_user, cmd.count_3_user];
        let mut seen = HashSet::new();
        let shared_counter = assigned.iter().flatten().any(|u| !seen.insert(*u));
        if shared_counter && cmd.execution_mode == ExecutionMode::Parallel {
            return Err(CountingError::SequentialModeRequired);
        }

        if let (Some(start), Some(end)) = (cmd.scheduled_start, cmd.scheduled_end) {
            if end < start {
                return Err(CountingError::validation(
                    "scheduled_end must not precede scheduled_start",
                ));
            }
        }
        if cmd.policy.flag_threshold_pct < Quantity::ZERO {
            return Err(CountingError::validation(
                "flag threshold must not be negative",
            ));
        }

        Ok(vec![CountingEvent::SessionCreated(SessionCreated {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            share_id: cmd.share_id,
            scope: cmd.scope.clone(),
            execution_mode: cmd.execution_mode,
            requires_count_2: cmd.requires_count_2,
            requires_count_3: cmd.requires_count_3,
            allow_unexpected_items,
            count_1_user,
            count_2_user: cmd.count_2_user,
            count_3_user: cmd.count_3_user,
            scheduled_start: cmd.scheduled_start,
            scheduled_end: cmd.scheduled_end,
            instructions: cmd.instructions.clone(),
            policy: cmd.policy,
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_schedule(&self, cmd: &ScheduleSession) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;
        self.status.ensure_transition(SessionStatus::Scheduled)?;

        if let Some(end) = cmd.scheduled_end {
            if end < cmd.scheduled_start {
                return Err(CountingError::validation(
                    "scheduled_end must not precede scheduled_start",
                ));
            }
        }

        Ok(vec![CountingEvent::SessionScheduled(SessionScheduled {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            scheduled_start: cmd.scheduled_start,
            scheduled_end: cmd.scheduled_end,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_activate(&self, cmd: &ActivateSession) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;
        self.status.ensure_transition(SessionStatus::Count1InProgress)?;

        if cmd.items.is_empty() {
            return Err(CountingError::invalid_scope(
                "scope resolved to no countable items",
            ));
        }
        let mut ids = HashSet::new();
        let mut tuples = HashSet::new();
        for item in &cmd.items {
            let r = &item.resolved;
            if !ids.insert(item.item_id) {
                return Err(CountingError::validation(format!(
                    "duplicate item id {}",
                    item.item_id
                )));
            }
            if !tuples.insert((r.product_id, r.variant_id, r.location_id)) {
                return Err(CountingError::validation(format!(
                    "product {} appears twice at location {}",
                    r.product_id, r.location_id
                )));
            }
        }

        let count_1_user = self
            .count_1_user
            .ok_or_else(|| DomainError::invariant("count_1_user missing"))?;
        let parallel_second = self.requires_count_2 && self.execution_mode == ExecutionMode::Parallel;
        let count_2_user = if parallel_second {
            Some(
                self.count_2_user
                    .ok_or_else(|| DomainError::invariant("count_2_user missing"))?,
            )
        } else {
            None
        };

        let stamp = self.stamp(cmd.occurred_at)?;
        let mut batch = Batch::new(self, stamp);
        batch.emit(CountingEvent::SessionActivated(SessionActivated {
            tenant_id: stamp.tenant_id,
            session_id: stamp.session_id,
            items: cmd.items.clone(),
            activated_by: cmd.activated_by,
            occurred_at: stamp.occurred_at,
        }));
        let deadline = self.scheduled_end;
        batch.open_assignment(count_1_user, CountNumber::First, 1, deadline);
        if let Some(counter) = count_2_user {
            batch.open_assignment(counter, CountNumber::Second, 1, deadline);
        }
        Ok(batch.finish())
    }

    fn handle_submit(&self, cmd: &SubmitCount) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;

        let assignment = self
            .active_assignment_for(cmd.counter)
            .ok_or(CountingError::Unauthorized)?;
        Self::ensure_quantity(cmd.quantity)?;

        let item = self
            .item(cmd.item_id)
            .filter(|item| self.covers(assignment, item))
            .ok_or(CountingError::ItemNotInScope(cmd.item_id))?;

        let count = assignment.count_number;
        let existing = item.entry(count);
        if let Some(entry) = existing {
            if entry.quantity == cmd.quantity && entry.notes == cmd.notes {
                return Ok(Vec::new());
            }
        }
        if !item.is_pending() {
            // Resolution locked the entry; only an identical retry is accepted.
            return Err(CountingError::EntryLocked(cmd.item_id));
        }

        let key = (assignment.counter, count, assignment.round);
        let mut batch = Batch::new(self, self.stamp(cmd.occurred_at)?);
        batch.submit(cmd.item_id, key, cmd.quantity, cmd.notes.clone());
        batch.reconcile_item(cmd.item_id)?;
        batch.advance()?;
        Ok(batch.finish())
    }

    fn handle_register_unexpected(
        &self,
        cmd: &RegisterUnexpectedItem,
    ) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;

        if !self.allow_unexpected_items {
            return Err(CountingError::validation(
                "session does not accept unexpected items",
            ));
        }
        if self.status != SessionStatus::Count1InProgress {
            return Err(CountingError::validation(
                "unexpected items can only be registered while count 1 is in progress",
            ));
        }
        let assignment = self
            .active_assignment_for(cmd.counter)
            .ok_or(CountingError::Unauthorized)?;
        Self::ensure_quantity(cmd.quantity)?;

        let r = &cmd.item.resolved;
        if self.item_index.contains_key(&cmd.item.item_id) {
            return Err(CountingError::validation(format!(
                "item id {} already exists",
                cmd.item.item_id
            )));
        }
        let already_in_scope = self.items.iter().any(|i| {
            i.product_id() == r.product_id
                && i.variant_id() == r.variant_id
                && i.location_id() == r.location_id
        });
        if already_in_scope {
            return Err(CountingError::validation(
                "item is already in scope; submit a count for it instead",
            ));
        }

        let mut item = cmd.item.clone();
        item.resolved.theoretical_qty = Quantity::ZERO;
        let item_id = item.item_id;
        let key = (assignment.counter, assignment.count_number, assignment.round);

        let stamp = self.stamp(cmd.occurred_at)?;
        let mut batch = Batch::new(self, stamp);
        batch.emit(CountingEvent::UnexpectedItemRegistered(UnexpectedItemRegistered {
            tenant_id: stamp.tenant_id,
            session_id: stamp.session_id,
            item,
            counter: cmd.counter,
            occurred_at: stamp.occurred_at,
        }));
        batch.submit(item_id, key, cmd.quantity, cmd.notes.clone());
        batch.reconcile_item(item_id)?;
        batch.advance()?;
        Ok(batch.finish())
    }

    fn handle_trigger_third_count(
        &self,
        cmd: &TriggerThirdCount,
    ) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;

        if !self.requires_count_3 {
            return Err(CountingError::validation(
                "session is not configured for a third count",
            ));
        }
        self.status.ensure_transition(SessionStatus::Count3InProgress)?;

        let requested: BTreeSet<CountableItemId> = cmd.item_ids.iter().copied().collect();
        if requested.is_empty() {
            return Err(CountingError::validation(
                "third count requires at least one item",
            ));
        }
        for id in &requested {
            let item = self.item(*id).ok_or(CountingError::ItemNotInScope(*id))?;
            if !item.is_third_count_candidate() {
                return Err(CountingError::validation(format!(
                    "item {id} is not a third-count candidate"
                )));
            }
        }
        let counter = self
            .count_3_user
            .ok_or_else(|| DomainError::invariant("count_3_user missing"))?;

        let round = self.third_count_rounds + 1;
        let deadline = cmd.deadline.or(self.scheduled_end);
        let stamp = self.stamp(cmd.occurred_at)?;
        let mut batch = Batch::new(self, stamp);
        batch.emit(CountingEvent::ThirdCountTriggered(ThirdCountTriggered {
            tenant_id: stamp.tenant_id,
            session_id: stamp.session_id,
            round,
            item_ids: requested.into_iter().collect(),
            counter,
            deadline,
            triggered_by: cmd.triggered_by,
            occurred_at: stamp.occurred_at,
        }));
        batch.transition(SessionStatus::Count3InProgress)?;
        batch.open_assignment(counter, CountNumber::Third, round, deadline);
        Ok(batch.finish())
    }

    fn handle_submit_for_review(
        &self,
        cmd: &SubmitForReview,
    ) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;
        self.status.ensure_transition(SessionStatus::PendingReview)?;

        let mut batch = Batch::new(self, self.stamp(cmd.occurred_at)?);
        batch.sweep()?;
        batch.transition(SessionStatus::PendingReview)?;
        Ok(batch.finish())
    }

    fn handle_manual_override(
        &self,
        cmd: &ManualOverride,
    ) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;

        if !self.status.is_activated() {
            return Err(CountingError::validation(
                "session has not been activated",
            ));
        }
        let item = self
            .item(cmd.item_id)
            .ok_or(CountingError::ItemNotInScope(cmd.item_id))?;
        if cmd.notes.trim().chars().count() < MIN_OVERRIDE_NOTES_LEN {
            return Err(CountingError::ManualOverrideRequiresNotes);
        }
        Self::ensure_quantity(cmd.quantity)?;

        // A sequential count 2 that has not opened yet still owes an entry.
        let slot_empty = item.entry(CountNumber::First).is_none()
            || (self.requires_count_2 && item.entry(CountNumber::Second).is_none());
        let awaiting_count = slot_empty
            || self
                .assignments
                .iter()
                .filter(|a| self.is_assignment_active(a) && self.covers(a, item))
                .any(|a| item.entry(a.count_number).is_none());
        if awaiting_count {
            return Err(CountingError::validation(
                "item is still being counted in the open phase",
            ));
        }

        let mut resolution = Resolution::new(
            &self.policy,
            ResolutionMethod::ManualOverride,
            cmd.quantity,
            item.theoretical_qty(),
            Some(cmd.notes.trim().to_string()),
        );
        resolution.flag = None;

        let mut batch = Batch::new(self, self.stamp(cmd.occurred_at)?);
        batch.resolve(cmd.item_id, resolution, Some(cmd.decided_by))?;
        batch.advance()?;
        Ok(batch.finish())
    }

    fn handle_cancel(&self, cmd: &CancelSession) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.status.ensure_transition(SessionStatus::Cancelled)?;

        let reason = cmd.reason.trim();
        if reason.is_empty() {
            return Err(CountingError::validation("cancellation requires a reason"));
        }

        Ok(vec![CountingEvent::SessionCancelled(SessionCancelled {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            from: self.status,
            reason: reason.to_string(),
            cancelled_by: cmd.cancelled_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_finalize(&self, cmd: &FinalizeSession) -> Result<Vec<CountingEvent>, CountingError> {
        self.ensure_target(cmd.tenant_id, cmd.session_id)?;
        self.ensure_not_terminal()?;

        if self.status.is_activated() {
            let unresolved = self.unresolved_item_ids();
            if !unresolved.is_empty() {
                return Err(CountingError::UnresolvedItems(unresolved));
            }
        }
        self.status.ensure_transition(SessionStatus::Finalized)?;

        Ok(vec![CountingEvent::SessionFinalized(SessionFinalized {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            finalized_by: cmd.finalized_by,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ids::{LocationId, ProductId, WarehouseId};
    use crate::item::ItemDescriptor;
    use crate::scope::ResolvedItem;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_session_id() -> SessionId {
        SessionId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    pub(crate) fn new_item(sku: &str, theoretical: Quantity) -> NewCountableItem {
        NewCountableItem {
            item_id: CountableItemId::new(),
            resolved: ResolvedItem {
                product_id: ProductId::new(),
                variant_id: None,
                location_id: LocationId::new(),
                warehouse_id: WarehouseId::new(),
                theoretical_qty: theoretical,
                descriptor: ItemDescriptor {
                    sku: sku.to_string(),
                    product_name: format!("Product {sku}"),
                    variant_name: None,
                    location_name: "Aisle 1".to_string(),
                    warehouse_name: "Main".to_string(),
                    unit_of_measure: "ea".to_string(),
                    barcode: Some(format!("BC-{sku}")),
                },
            },
        }
    }

    /// Drives one session through handle + apply, like the dispatcher does.
    pub(crate) struct Harness {
        pub session: CountingSession,
        pub tenant_id: TenantId,
        pub session_id: SessionId,
        pub supervisor: UserId,
        pub c1: UserId,
        pub c2: UserId,
        pub c3: UserId,
    }

    pub(crate) struct Setup {
        pub mode: ExecutionMode,
        pub requires_count_2: bool,
        pub requires_count_3: bool,
        pub scope: CountingScope,
        pub allow_unexpected_items: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                mode: ExecutionMode::Parallel,
                requires_count_2: false,
                requires_count_3: false,
                scope: CountingScope::Product {
                    product_ids: [ProductId::new()].into_iter().collect(),
                },
                allow_unexpected_items: false,
            }
        }
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let session_id = test_session_id();
            Self {
                session: CountingSession::empty(session_id),
                tenant_id: test_tenant_id(),
                session_id,
                supervisor: UserId::new(),
                c1: UserId::new(),
                c2: UserId::new(),
                c3: UserId::new(),
            }
        }

        pub(crate) fn run(
            &mut self,
            cmd: CountingCommand,
        ) -> Result<Vec<CountingEvent>, CountingError> {
            let events = self.session.handle(&cmd)?;
            for e in &events {
                self.session.apply(e);
            }
            Ok(events)
        }

        pub(crate) fn create_cmd(&self, setup: &Setup) -> CreateSession {
            CreateSession {
                tenant_id: self.tenant_id,
                session_id: self.session_id,
                share_id: Uuid::new_v4(),
                scope: setup.scope.clone(),
                execution_mode: setup.mode,
                requires_count_2: setup.requires_count_2,
                requires_count_3: setup.requires_count_3,
                allow_unexpected_items: setup.allow_unexpected_items,
                count_1_user: Some(self.c1),
                count_2_user: setup.requires_count_2.then_some(self.c2),
                count_3_user: setup.requires_count_3.then_some(self.c3),
                scheduled_start: None,
                scheduled_end: None,
                instructions: Some("Count everything on the shelf".to_string()),
                policy: ReconciliationPolicy::default(),
                created_by: self.supervisor,
                occurred_at: test_time(),
            }
        }

        /// Create + activate with the given items.
        pub(crate) fn start(&mut self, setup: Setup, items: &[NewCountableItem]) {
            let create = self.create_cmd(&setup);
            self.start_with(create, items);
        }

        pub(crate) fn start_with(&mut self, create: CreateSession, items: &[NewCountableItem]) {
            self.run(CountingCommand::CreateSession(create)).unwrap();
            self.run(CountingCommand::ActivateSession(ActivateSession {
                tenant_id: self.tenant_id,
                session_id: self.session_id,
                items: items.to_vec(),
                activated_by: self.supervisor,
                occurred_at: test_time(),
            }))
            .unwrap();
        }

        pub(crate) fn submit(
            &mut self,
            counter: UserId,
            item_id: CountableItemId,
            quantity: Quantity,
        ) -> Result<Vec<CountingEvent>, CountingError> {
            self.run(CountingCommand::SubmitCount(SubmitCount {
                tenant_id: self.tenant_id,
                session_id: self.session_id,
                item_id,
                counter,
                quantity,
                notes: None,
                occurred_at: test_time(),
            }))
        }

        pub(crate) fn trigger(
            &mut self,
            item_ids: Vec<CountableItemId>,
        ) -> Result<Vec<CountingEvent>, CountingError> {
            self.run(CountingCommand::TriggerThirdCount(TriggerThirdCount {
                tenant_id: self.tenant_id,
                session_id: self.session_id,
                item_ids,
                deadline: None,
                triggered_by: self.supervisor,
                occurred_at: test_time(),
            }))
        }

        pub(crate) fn override_item(
            &mut self,
            item_id: CountableItemId,
            quantity: Quantity,
            notes: &str,
        ) -> Result<Vec<CountingEvent>, CountingError> {
            self.run(CountingCommand::ManualOverride(ManualOverride {
                tenant_id: self.tenant_id,
                session_id: self.session_id,
                item_id,
                quantity,
                notes: notes.to_string(),
                decided_by: self.supervisor,
                occurred_at: test_time(),
            }))
        }

        pub(crate) fn finalize(&mut self) -> Result<Vec<CountingEvent>, CountingError> {
            self.run(CountingCommand::FinalizeSession(FinalizeSession {
                tenant_id: self.tenant_id,
                session_id: self.session_id,
                finalized_by: self.supervisor,
                occurred_at: test_time(),
            }))
        }

        pub(crate) fn cancel(&mut self, reason: &str) -> Result<Vec<CountingEvent>, CountingError> {
            self.run(CountingCommand::CancelSession(CancelSession {
                tenant_id: self.tenant_id,
                session_id: self.session_id,
                reason: reason.to_string(),
                cancelled_by: self.supervisor,
                occurred_at: test_time(),
            }))
        }

        pub(crate) fn item(&self, id: CountableItemId) -> &CountableItem {
            self.session.item(id).unwrap()
        }
    }

    fn two_counts() -> Setup {
        Setup {
            requires_count_2: true,
            ..Setup::default()
        }
    }

    fn three_counts() -> Setup {
        Setup {
            requires_count_2: true,
            requires_count_3: true,
            ..Setup::default()
        }
    }

    #[test]
    fn create_session_emits_session_created_event() {
        let h = Harness::new();
        let cmd = h.create_cmd(&Setup::default());
        let events = h
            .session
            .handle(&CountingCommand::CreateSession(cmd))
            .unwrap();
        assert_eq!(events.len(), 1);

        match &events[0] {
            CountingEvent::SessionCreated(e) => {
                assert_eq!(e.tenant_id, h.tenant_id);
                assert_eq!(e.session_id, h.session_id);
                assert_eq!(e.count_1_user, h.c1);
                assert!(!e.allow_unexpected_items);
            }
            _ => panic!("Expected SessionCreated event"),
        }
    }

    #[test]
    fn scenario_a_single_count_matching_theoretical() {
        let mut h = Harness::new();
        let item = new_item("A", dec!(50));
        h.start(
            Setup {
                scope: CountingScope::ProductLocation {
                    product_ids: [item.resolved.product_id].into_iter().collect(),
                    location_id: item.resolved.location_id,
                },
                ..Setup::default()
            },
            &[item.clone()],
        );
        assert_eq!(h.session.status(), SessionStatus::Count1InProgress);

        h.submit(h.c1, item.item_id, dec!(50)).unwrap();

        let it = h.item(item.item_id);
        assert_eq!(it.resolution_method(), ResolutionMethod::AutoAllMatch);
        assert_eq!(it.final_qty(), Some(dec!(50)));
        assert_eq!(it.variance(), Some(dec!(0)));
        assert!(!it.is_flagged());
        assert_eq!(h.session.status(), SessionStatus::PendingReview);

        h.finalize().unwrap();
        assert_eq!(h.session.status(), SessionStatus::Finalized);
    }

    #[test]
    fn scenario_b_counters_agree_against_theoretical() {
        let mut h = Harness::new();
        let item = new_item("B", dec!(50));
        h.start(two_counts(), &[item.clone()]);

        h.submit(h.c1, item.item_id, dec!(48)).unwrap();
        assert!(h.item(item.item_id).is_pending());
        h.submit(h.c2, item.item_id, dec!(48)).unwrap();

        let it = h.item(item.item_id);
        assert_eq!(it.resolution_method(), ResolutionMethod::AutoCountersAgree);
        assert_eq!(it.final_qty(), Some(dec!(48)));
        assert_eq!(it.variance(), Some(dec!(-2)));
        assert_eq!(h.session.status(), SessionStatus::PendingReview);
    }

    #[test]
    fn scenario_c_third_count_is_decisive() {
        let mut h = Harness::new();
        let item = new_item("C", dec!(50));
        h.start(three_counts(), &[item.clone()]);

        h.submit(h.c1, item.item_id, dec!(48)).unwrap();
        h.submit(h.c2, item.item_id, dec!(52)).unwrap();

        let it = h.item(item.item_id);
        assert!(it.is_pending());
        assert!(it.is_flagged());
        assert_eq!(it.flag_reason(), Some(FlagReason::NeedsAttention));
        assert_eq!(h.session.status(), SessionStatus::Count2Completed);
        assert_eq!(h.session.third_count_candidates(), vec![item.item_id]);

        // Not yet triggered: the third counter has nothing to write to.
        let err = h.submit(h.c3, item.item_id, dec!(48)).unwrap_err();
        assert_eq!(err, CountingError::Unauthorized);

        h.trigger(vec![item.item_id]).unwrap();
        assert_eq!(h.session.status(), SessionStatus::Count3InProgress);

        h.submit(h.c3, item.item_id, dec!(48)).unwrap();
        let it = h.item(item.item_id);
        assert_eq!(it.resolution_method(), ResolutionMethod::ThirdCountDecisive);
        assert_eq!(it.final_qty(), Some(dec!(48)));
        assert!(it.resolution_notes().unwrap_or_default().contains("outlier"));
        assert_eq!(h.session.status(), SessionStatus::PendingReview);
    }

    #[test]
    fn scenario_d_all_distinct_requires_manual_override() {
        let mut h = Harness::new();
        let item = new_item("D", dec!(50));
        h.start(three_counts(), &[item.clone()]);

        h.submit(h.c1, item.item_id, dec!(48)).unwrap();
        h.submit(h.c2, item.item_id, dec!(52)).unwrap();
        h.trigger(vec![item.item_id]).unwrap();
        h.submit(h.c3, item.item_id, dec!(55)).unwrap();

        let it = h.item(item.item_id);
        assert!(it.is_pending());
        assert_eq!(it.flag_reason(), Some(FlagReason::ManualOverrideRequired));
        assert_eq!(h.session.status(), SessionStatus::PendingReview);

        match h.finalize().unwrap_err() {
            CountingError::UnresolvedItems(ids) if ids == vec![item.item_id] => {}
            other => panic!("Expected UnresolvedItems, got {other:?}"),
        }

        h.override_item(item.item_id, dec!(50), "Recount confirmed by supervisor on shelf")
            .unwrap();
        let it = h.item(item.item_id);
        assert_eq!(it.resolution_method(), ResolutionMethod::ManualOverride);
        assert_eq!(it.final_qty(), Some(dec!(50)));
        assert!(!it.is_flagged());
        assert_eq!(it.resolution_history().len(), 1);
        assert_eq!(it.resolution_history()[0].decided_by, Some(h.supervisor));

        h.finalize().unwrap();
        assert_eq!(h.session.status(), SessionStatus::Finalized);
    }

    #[test]
    fn scenario_e_same_counter_twice_requires_sequential_mode() {
        let h = Harness::new();
        let mut cmd = h.create_cmd(&two_counts());
        cmd.count_2_user = Some(h.c1);

        let err = h
            .session
            .handle(&CountingCommand::CreateSession(cmd.clone()))
            .unwrap_err();
        assert_eq!(err, CountingError::SequentialModeRequired);

        cmd.execution_mode = ExecutionMode::Sequential;
        assert!(h.session.handle(&CountingCommand::CreateSession(cmd)).is_ok());
    }

    #[test]
    fn unexpected_items_are_only_allowed_for_full_inventory() {
        let h = Harness::new();
        let mut cmd = h.create_cmd(&Setup::default());
        cmd.allow_unexpected_items = true;
        match h
            .session
            .handle(&CountingCommand::CreateSession(cmd.clone()))
            .unwrap_err()
        {
            CountingError::InvalidScope(_) => {}
            other => panic!("Expected InvalidScope, got {other:?}"),
        }

        cmd.scope = CountingScope::FullInventory;
        cmd.allow_unexpected_items = false;
        let events = h
            .session
            .handle(&CountingCommand::CreateSession(cmd))
            .unwrap();
        match &events[0] {
            CountingEvent::SessionCreated(e) => assert!(e.allow_unexpected_items),
            _ => panic!("Expected SessionCreated event"),
        }
    }

    #[test]
    fn empty_scope_filters_are_rejected() {
        let h = Harness::new();
        let mut cmd = h.create_cmd(&Setup::default());
        cmd.scope = CountingScope::Category {
            category_ids: BTreeSet::new(),
        };
        assert!(matches!(
            h.session.handle(&CountingCommand::CreateSession(cmd)),
            Err(CountingError::InvalidScope(_))
        ));
    }

    #[test]
    fn submit_rejects_strangers_negative_quantities_and_foreign_items() {
        let mut h = Harness::new();
        let item = new_item("X", dec!(5));
        h.start(two_counts(), &[item.clone()]);

        let stranger = UserId::new();
        assert_eq!(
            h.submit(stranger, item.item_id, dec!(5)).unwrap_err(),
            CountingError::Unauthorized
        );
        assert!(matches!(
            h.submit(h.c1, item.item_id, dec!(-1)).unwrap_err(),
            CountingError::InvalidQuantity(_)
        ));
        let foreign = CountableItemId::new();
        assert_eq!(
            h.submit(h.c1, foreign, dec!(1)).unwrap_err(),
            CountingError::ItemNotInScope(foreign)
        );
        // Nothing was written by the rejected submissions.
        assert!(h.item(item.item_id).entry(CountNumber::First).is_none());
    }

    #[test]
    fn counter_overwrites_own_entry_until_resolved() {
        let mut h = Harness::new();
        let a = new_item("A", dec!(10));
        let b = new_item("B", dec!(10));
        h.start(two_counts(), &[a.clone(), b.clone()]);

        h.submit(h.c1, a.item_id, dec!(7)).unwrap();
        h.submit(h.c1, a.item_id, dec!(9)).unwrap();
        assert_eq!(
            h.item(a.item_id).entry(CountNumber::First).map(|e| e.quantity),
            Some(dec!(9))
        );

        // Same value again is a no-op.
        assert!(h.submit(h.c1, a.item_id, dec!(9)).unwrap().is_empty());

        h.submit(h.c2, a.item_id, dec!(9)).unwrap();
        assert_eq!(
            h.item(a.item_id).resolution_method(),
            ResolutionMethod::AutoCountersAgree
        );
        assert_eq!(
            h.submit(h.c1, a.item_id, dec!(8)).unwrap_err(),
            CountingError::EntryLocked(a.item_id)
        );
        assert!(h.submit(h.c1, a.item_id, dec!(9)).unwrap().is_empty());
    }

    #[test]
    fn sequential_mode_opens_one_count_at_a_time() {
        let mut h = Harness::new();
        let item = new_item("S", dec!(3));
        let setup = Setup {
            mode: ExecutionMode::Sequential,
            ..two_counts()
        };
        h.start(setup, &[item.clone()]);

        assert_eq!(
            h.submit(h.c2, item.item_id, dec!(3)).unwrap_err(),
            CountingError::Unauthorized
        );
        h.submit(h.c1, item.item_id, dec!(3)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::Count2InProgress);

        // Count 1 is closed now.
        assert_eq!(
            h.submit(h.c1, item.item_id, dec!(4)).unwrap_err(),
            CountingError::Unauthorized
        );
        h.submit(h.c2, item.item_id, dec!(3)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::PendingReview);
    }

    #[test]
    fn same_counter_sequentially_counts_both_phases() {
        let mut h = Harness::new();
        let item = new_item("S", dec!(3));
        let mut cmd = h.create_cmd(&Setup {
            mode: ExecutionMode::Sequential,
            ..two_counts()
        });
        cmd.count_2_user = Some(h.c1);
        h.run(CountingCommand::CreateSession(cmd)).unwrap();
        h.run(CountingCommand::ActivateSession(ActivateSession {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            items: vec![item.clone()],
            activated_by: h.supervisor,
            occurred_at: test_time(),
        }))
        .unwrap();

        h.submit(h.c1, item.item_id, dec!(3)).unwrap();
        let active = h.session.active_assignment_for(h.c1).unwrap();
        assert_eq!(active.count_number, CountNumber::Second);
        h.submit(h.c1, item.item_id, dec!(3)).unwrap();
        assert_eq!(
            h.item(item.item_id).resolution_method(),
            ResolutionMethod::AutoCountersAgree
        );
    }

    #[test]
    fn phase_completion_chain_is_emitted_in_one_batch() {
        let mut h = Harness::new();
        let item = new_item("P", dec!(1));
        h.start(Setup::default(), &[item.clone()]);

        let events = h.submit(h.c1, item.item_id, dec!(1)).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "counting.count.submitted",
                "counting.item.resolved",
                "counting.assignment.completed",
                "counting.session.status_changed",
                "counting.session.status_changed",
            ]
        );
    }

    #[test]
    fn assignment_completes_only_when_every_item_is_counted() {
        let mut h = Harness::new();
        let a = new_item("A", dec!(1));
        let b = new_item("B", dec!(1));
        h.start(Setup::default(), &[a.clone(), b.clone()]);

        h.submit(h.c1, a.item_id, dec!(1)).unwrap();
        let assignment = h.session.active_assignment_for(h.c1).unwrap();
        assert!(!assignment.is_completed());
        assert_eq!(h.session.assignment_progress(assignment), (2, 1));
        assert_eq!(h.session.status(), SessionStatus::Count1InProgress);

        h.submit(h.c1, b.item_id, dec!(1)).unwrap();
        assert!(h.session.assignments()[0].is_completed());
    }

    #[test]
    fn single_count_mismatch_waits_for_override() {
        let mut h = Harness::new();
        let item = new_item("M", dec!(10));
        h.start(Setup::default(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(7)).unwrap();

        let it = h.item(item.item_id);
        assert!(it.is_pending());
        assert_eq!(it.flag_reason(), Some(FlagReason::CountMismatch));
        assert_eq!(h.session.status(), SessionStatus::PendingReview);

        assert_eq!(
            h.override_item(item.item_id, dec!(7), "too short").unwrap_err(),
            CountingError::ManualOverrideRequiresNotes
        );
        h.override_item(item.item_id, dec!(7), "Shelf recounted, seven units")
            .unwrap();
        h.finalize().unwrap();
    }

    #[test]
    fn override_is_rejected_while_item_is_still_being_counted() {
        let mut h = Harness::new();
        let item = new_item("O", dec!(10));
        h.start(two_counts(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(10)).unwrap();

        assert!(matches!(
            h.override_item(item.item_id, dec!(10), "Supervisor counted it"),
            Err(CountingError::Validation(_))
        ));
    }

    #[test]
    fn override_waits_for_a_sequential_count_2_that_has_not_opened() {
        let mut h = Harness::new();
        let a = new_item("A", dec!(50));
        let b = new_item("B", dec!(10));
        let setup = Setup {
            mode: ExecutionMode::Sequential,
            ..two_counts()
        };
        h.start(setup, &[a.clone(), b.clone()]);
        h.submit(h.c1, a.item_id, dec!(48)).unwrap();

        assert!(matches!(
            h.override_item(a.item_id, dec!(49), "Damaged unit found behind shelf"),
            Err(CountingError::Validation(_))
        ));

        h.submit(h.c1, b.item_id, dec!(10)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::Count2InProgress);
        h.submit(h.c2, a.item_id, dec!(48)).unwrap();
        h.submit(h.c2, b.item_id, dec!(10)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::PendingReview);

        h.override_item(a.item_id, dec!(49), "Damaged unit found behind shelf")
            .unwrap();
        h.finalize().unwrap();
    }

    #[test]
    fn resolved_entry_rejects_a_retry_with_different_notes() {
        let mut h = Harness::new();
        let item = new_item("N", dec!(5));
        let other = new_item("O", dec!(5));
        h.start(two_counts(), &[item.clone(), other.clone()]);
        h.submit(h.c1, item.item_id, dec!(5)).unwrap();
        h.submit(h.c2, item.item_id, dec!(5)).unwrap();
        assert!(!h.item(item.item_id).is_pending());

        let retry = h.run(CountingCommand::SubmitCount(SubmitCount {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            item_id: item.item_id,
            counter: h.c1,
            quantity: dec!(5),
            notes: Some("one box was crushed".to_string()),
            occurred_at: test_time(),
        }));
        assert_eq!(retry.unwrap_err(), CountingError::EntryLocked(item.item_id));
        assert!(h.submit(h.c1, item.item_id, dec!(5)).unwrap().is_empty());
    }

    #[test]
    fn automatic_resolution_never_replaces_a_settled_item() {
        let mut h = Harness::new();
        let item = new_item("R", dec!(5));
        let other = new_item("Q", dec!(5));
        h.start(two_counts(), &[item.clone(), other.clone()]);
        h.submit(h.c1, item.item_id, dec!(5)).unwrap();
        h.submit(h.c2, item.item_id, dec!(5)).unwrap();

        let stamp = h.session.stamp(test_time()).unwrap();
        let mut batch = Batch::new(&h.session, stamp);
        let policy = h.session.policy;
        let decisive = Resolution::new(
            &policy,
            ResolutionMethod::ThirdCountDecisive,
            dec!(6),
            dec!(5),
            None,
        );
        assert_eq!(
            batch.resolve(item.item_id, decisive, None).unwrap_err(),
            CountingError::EntryLocked(item.item_id)
        );

        let manual = Resolution::new(
            &policy,
            ResolutionMethod::ManualOverride,
            dec!(4),
            dec!(5),
            Some("One unit found damaged".to_string()),
        );
        assert!(batch.resolve(item.item_id, manual, Some(h.supervisor)).is_ok());
    }

    #[test]
    fn manual_override_supersedes_automatic_resolution_and_keeps_history() {
        let mut h = Harness::new();
        let item = new_item("H", dec!(50));
        h.start(two_counts(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(48)).unwrap();
        h.submit(h.c2, item.item_id, dec!(48)).unwrap();

        h.override_item(item.item_id, dec!(49), "Damaged unit found behind shelf")
            .unwrap();
        let it = h.item(item.item_id);
        assert_eq!(it.resolution_method(), ResolutionMethod::ManualOverride);
        let methods: Vec<ResolutionMethod> =
            it.resolution_history().iter().map(|r| r.method).collect();
        assert_eq!(
            methods,
            vec![
                ResolutionMethod::AutoCountersAgree,
                ResolutionMethod::ManualOverride
            ]
        );
    }

    #[test]
    fn third_count_trigger_validates_candidates() {
        let mut h = Harness::new();
        let agree = new_item("A", dec!(5));
        let split = new_item("S", dec!(5));
        h.start(three_counts(), &[agree.clone(), split.clone()]);
        h.submit(h.c1, agree.item_id, dec!(5)).unwrap();
        h.submit(h.c2, agree.item_id, dec!(5)).unwrap();
        h.submit(h.c1, split.item_id, dec!(4)).unwrap();
        h.submit(h.c2, split.item_id, dec!(6)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::Count2Completed);

        assert!(matches!(
            h.trigger(vec![]).unwrap_err(),
            CountingError::Validation(_)
        ));
        assert!(matches!(
            h.trigger(vec![agree.item_id]).unwrap_err(),
            CountingError::Validation(_)
        ));
        let unknown = CountableItemId::new();
        assert_eq!(
            h.trigger(vec![unknown]).unwrap_err(),
            CountingError::ItemNotInScope(unknown)
        );

        h.trigger(vec![split.item_id]).unwrap();
        // The agreed item is not in the third-count round.
        assert_eq!(
            h.submit(h.c3, agree.item_id, dec!(5)).unwrap_err(),
            CountingError::ItemNotInScope(agree.item_id)
        );
    }

    #[test]
    fn third_count_without_configuration_is_rejected() {
        let mut h = Harness::new();
        let item = new_item("N", dec!(5));
        h.start(two_counts(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(4)).unwrap();
        h.submit(h.c2, item.item_id, dec!(6)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::PendingReview);

        assert!(matches!(
            h.trigger(vec![item.item_id]).unwrap_err(),
            CountingError::Validation(_)
        ));
    }

    #[test]
    fn reopening_third_count_from_review_starts_a_new_round() {
        let mut h = Harness::new();
        let item = new_item("R", dec!(50));
        h.start(three_counts(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(48)).unwrap();
        h.submit(h.c2, item.item_id, dec!(52)).unwrap();
        h.trigger(vec![item.item_id]).unwrap();
        h.submit(h.c3, item.item_id, dec!(55)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::PendingReview);

        h.trigger(vec![item.item_id]).unwrap();
        assert_eq!(h.session.third_count_rounds(), 2);
        let it = h.item(item.item_id);
        assert_eq!(it.third_count_round(), Some(2));
        assert!(it.entry(CountNumber::Third).is_none());
        assert_eq!(it.prior_third_counts().len(), 1);
        assert_eq!(it.prior_third_counts()[0].entry.quantity, dec!(55));

        h.submit(h.c3, item.item_id, dec!(52)).unwrap();
        let it = h.item(item.item_id);
        assert_eq!(it.resolution_method(), ResolutionMethod::ThirdCountDecisive);
        assert_eq!(it.final_qty(), Some(dec!(52)));
        assert_eq!(h.session.assignments().len(), 4);
    }

    #[test]
    fn submit_for_review_skips_escalation() {
        let mut h = Harness::new();
        let item = new_item("V", dec!(5));
        h.start(three_counts(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(4)).unwrap();
        h.submit(h.c2, item.item_id, dec!(6)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::Count2Completed);

        h.run(CountingCommand::SubmitForReview(SubmitForReview {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            submitted_by: h.supervisor,
            occurred_at: test_time(),
        }))
        .unwrap();
        assert_eq!(h.session.status(), SessionStatus::PendingReview);
    }

    #[test]
    fn cancellation_requires_reason_and_blocks_submissions() {
        let mut h = Harness::new();
        let item = new_item("Z", dec!(5));
        h.start(two_counts(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(5)).unwrap();

        assert!(matches!(
            h.cancel("   ").unwrap_err(),
            CountingError::Validation(_)
        ));
        h.cancel("Warehouse flooded").unwrap();
        assert_eq!(h.session.status(), SessionStatus::Cancelled);
        assert_eq!(h.session.cancellation_reason(), Some("Warehouse flooded"));

        assert_eq!(
            h.submit(h.c2, item.item_id, dec!(5)).unwrap_err(),
            CountingError::SessionCancelled
        );
        // Counted data stays for audit.
        assert!(h.item(item.item_id).entry(CountNumber::First).is_some());
        assert!(matches!(
            h.cancel("again").unwrap_err(),
            CountingError::InvalidStateTransition { .. }
        ));
    }

    #[test]
    fn finalized_session_rejects_everything() {
        let mut h = Harness::new();
        let item = new_item("F", dec!(1));
        h.start(Setup::default(), &[item.clone()]);
        h.submit(h.c1, item.item_id, dec!(1)).unwrap();
        h.finalize().unwrap();

        assert_eq!(
            h.submit(h.c1, item.item_id, dec!(2)).unwrap_err(),
            CountingError::SessionFinalized
        );
        assert_eq!(h.finalize().unwrap_err(), CountingError::SessionFinalized);
        assert!(matches!(
            h.cancel("too late").unwrap_err(),
            CountingError::InvalidStateTransition { .. }
        ));
    }

    #[test]
    fn activation_requires_draft_or_scheduled_and_items() {
        let mut h = Harness::new();
        let create = h.create_cmd(&Setup::default());
        h.run(CountingCommand::CreateSession(create)).unwrap();

        let empty = ActivateSession {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            items: vec![],
            activated_by: h.supervisor,
            occurred_at: test_time(),
        };
        assert!(matches!(
            h.run(CountingCommand::ActivateSession(empty)).unwrap_err(),
            CountingError::InvalidScope(_)
        ));

        h.run(CountingCommand::ScheduleSession(ScheduleSession {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            scheduled_start: test_time(),
            scheduled_end: None,
            occurred_at: test_time(),
        }))
        .unwrap();
        assert_eq!(h.session.status(), SessionStatus::Scheduled);

        let item = new_item("I", dec!(1));
        let activate = ActivateSession {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            items: vec![item],
            activated_by: h.supervisor,
            occurred_at: test_time(),
        };
        h.run(CountingCommand::ActivateSession(activate.clone())).unwrap();
        match h.run(CountingCommand::ActivateSession(activate)).unwrap_err() {
            CountingError::InvalidStateTransition { from, to } => {
                assert_eq!(from, SessionStatus::Count1InProgress);
                assert_eq!(to, SessionStatus::Count1InProgress);
            }
            other => panic!("Expected InvalidStateTransition, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_item_joins_scope_with_zero_theoretical() {
        let mut h = Harness::new();
        let known = new_item("K", dec!(2));
        h.start(
            Setup {
                scope: CountingScope::FullInventory,
                ..two_counts()
            },
            &[known.clone()],
        );
        h.submit(h.c2, known.item_id, dec!(2)).unwrap();
        assert!(h.session.assignments()[1].is_completed());
        assert_eq!(h.session.status(), SessionStatus::Count1InProgress);

        let mut found = new_item("U", dec!(99));
        found.resolved.location_id = known.resolved.location_id;
        h.run(CountingCommand::RegisterUnexpectedItem(RegisterUnexpectedItem {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            counter: h.c1,
            item: found.clone(),
            quantity: dec!(3),
            notes: Some("behind the pallet".to_string()),
            occurred_at: test_time(),
        }))
        .unwrap();

        let it = h.item(found.item_id);
        assert!(it.is_unexpected());
        assert_eq!(it.theoretical_qty(), dec!(0));
        assert_eq!(it.entry(CountNumber::First).map(|e| e.quantity), Some(dec!(3)));
        // Counter 2 has a new item to count.
        assert!(!h.session.assignments()[1].is_completed());

        h.submit(h.c1, known.item_id, dec!(2)).unwrap();
        assert_eq!(h.session.status(), SessionStatus::Count2InProgress);
        h.submit(h.c2, found.item_id, dec!(3)).unwrap();
        let it = h.item(found.item_id);
        assert_eq!(it.resolution_method(), ResolutionMethod::AutoCountersAgree);
        assert_eq!(it.flag_reason(), Some(FlagReason::VarianceExceedsThreshold));
        assert_eq!(h.session.status(), SessionStatus::PendingReview);
    }

    #[test]
    fn unexpected_items_rejected_when_not_allowed() {
        let mut h = Harness::new();
        let known = new_item("K", dec!(2));
        h.start(Setup::default(), &[known]);
        let err = h
            .run(CountingCommand::RegisterUnexpectedItem(RegisterUnexpectedItem {
                tenant_id: h.tenant_id,
                session_id: h.session_id,
                counter: h.c1,
                item: new_item("U", dec!(0)),
                quantity: dec!(1),
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, CountingError::Validation(_)));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let mut h = Harness::new();
        let item = new_item("H", dec!(5));
        h.start(two_counts(), &[item.clone()]);
        let before = h.session.clone();

        let cmd = CountingCommand::SubmitCount(SubmitCount {
            tenant_id: h.tenant_id,
            session_id: h.session_id,
            item_id: item.item_id,
            counter: h.c1,
            quantity: dec!(5),
            notes: None,
            occurred_at: test_time(),
        });
        let events1 = h.session.handle(&cmd).unwrap();
        let events2 = h.session.handle(&cmd).unwrap();
        assert_eq!(h.session, before);
        assert_eq!(events1, events2);
    }

    #[test]
    fn replay_rebuilds_identical_state() {
        let mut h = Harness::new();
        let item = new_item("R", dec!(50));
        let mut log = Vec::new();
        let create = h.create_cmd(&three_counts());
        log.extend(h.run(CountingCommand::CreateSession(create)).unwrap());
        log.extend(
            h.run(CountingCommand::ActivateSession(ActivateSession {
                tenant_id: h.tenant_id,
                session_id: h.session_id,
                items: vec![item.clone()],
                activated_by: h.supervisor,
                occurred_at: test_time(),
            }))
            .unwrap(),
        );
        log.extend(h.submit(h.c1, item.item_id, dec!(48)).unwrap());
        log.extend(h.submit(h.c2, item.item_id, dec!(52)).unwrap());

        let mut replayed = CountingSession::empty(h.session_id);
        for e in &log {
            replayed.apply(e);
        }
        assert_eq!(replayed, h.session);
        assert_eq!(replayed.version(), log.len() as u64);
    }

    #[test]
    fn tenant_mismatch_is_rejected() {
        let mut h = Harness::new();
        let item = new_item("T", dec!(1));
        h.start(Setup::default(), &[item.clone()]);
        let cmd = CountingCommand::SubmitCount(SubmitCount {
            tenant_id: test_tenant_id(),
            session_id: h.session_id,
            item_id: item.item_id,
            counter: h.c1,
            quantity: dec!(1),
            notes: None,
            occurred_at: test_time(),
        });
        match h.session.handle(&cmd).unwrap_err() {
            CountingError::Domain(DomainError::InvariantViolation(msg))
                if msg.contains("tenant mismatch") => {}
            other => panic!("Expected tenant mismatch, got {other:?}"),
        }
    }

    /// `(item index, counter index)` pairs in some arrival order.
    fn arrivals() -> impl Strategy<Value = (Vec<(u32, u32)>, Vec<usize>)> {
        proptest::collection::vec((0u32..4, 0u32..4), 1..4).prop_flat_map(|pairs| {
            let order: Vec<usize> = (0..pairs.len() * 2).collect();
            (Just(pairs), Just(order).prop_shuffle())
        })
    }

    type ItemOutcome = (ResolutionMethod, Option<Quantity>, Option<FlagReason>);

    fn run_in_order(pairs: &[(u32, u32)], order: &[usize]) -> Vec<ItemOutcome> {
        let mut h = Harness::new();
        let items: Vec<NewCountableItem> = (0..pairs.len())
            .map(|i| new_item(&format!("P{i}"), dec!(2)))
            .collect();
        h.start(three_counts(), &items);

        for &k in order {
            let (item_idx, counter_idx) = (k / 2, k % 2);
            let (a, b) = pairs[item_idx];
            let (counter, qty) = if counter_idx == 0 { (h.c1, a) } else { (h.c2, b) };
            h.submit(counter, items[item_idx].item_id, Quantity::from(qty)).unwrap();
        }

        items
            .iter()
            .map(|i| {
                let it = h.item(i.item_id);
                (it.resolution_method(), it.final_qty(), it.flag_reason())
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn submissions_from_different_counters_commute((pairs, order) in arrivals()) {
            let canonical: Vec<usize> = (0..pairs.len() * 2).collect();
            prop_assert_eq!(run_in_order(&pairs, &order), run_in_order(&pairs, &canonical));
        }
    }
}
