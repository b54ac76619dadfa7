//! Services host named action handlers. A handler resolves synchronously
//! (success or failure, with an optional reply) or returns `Pending` and
//! completes later through `Engine::finish_action_handle`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use volition_bus::{ActionStatus, BusAddress, ControlCommand, NodeType};
use volition_core::{BeliefContext, Message, ServiceHandle, UniqueId};

use crate::engine::EngineShared;
use crate::event::{ActionEvent, Event, EventBody};

/// Outcome of invoking an action handler.
pub enum ActionResult {
    Success,
    Failed,
    /// The work continues out of band; completion arrives later via the
    /// action handle.
    Pending,
}

/// What a handler sees: the requester's beliefs (agents hand their own
/// context in, services a private one), the request, and the reply under
/// construction.
pub struct ActionContext<'a> {
    pub beliefs: &'a mut BeliefContext,
    pub request: &'a Message,
    pub reply: &'a mut Message,
    pub handle: &'a crate::event::ActionHandle,
}

pub type ActionHandler = Arc<dyn Fn(&mut ActionContext<'_>) -> ActionResult + Send + Sync>;

/// Template a service instance is cloned from.
#[derive(Clone, Default)]
pub struct ServiceTemplate {
    pub name: String,
    pub handlers: HashMap<String, ActionHandler>,
}

impl ServiceTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn handle_action(
        mut self,
        action: impl Into<String>,
        handler: impl Fn(&mut ActionContext<'_>) -> ActionResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }
}

pub struct Service {
    handle: ServiceHandle,
    template: String,
    address: BusAddress,
    handlers: HashMap<String, ActionHandler>,
    /// Scratch context handed to handlers; services have no belief model
    /// of their own.
    beliefs: BeliefContext,
    inbox: VecDeque<Event>,
    shared: EngineShared,
    proxy: bool,
    available: bool,
}

impl Service {
    pub(crate) fn new(
        template: &ServiceTemplate,
        name: impl Into<String>,
        id: UniqueId,
        proxy: bool,
        shared: EngineShared,
    ) -> Self {
        let name = name.into();
        let handle = ServiceHandle {
            name: name.clone(),
            id,
        };
        Self {
            address: BusAddress::new(NodeType::Service, id, name),
            handle,
            template: template.name.clone(),
            handlers: template.handlers.clone(),
            beliefs: BeliefContext::new(),
            inbox: VecDeque::new(),
            shared,
            proxy,
            available: true,
        }
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    pub fn template_name(&self) -> &str {
        &self.template
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn handles_action(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn action_names(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    pub(crate) fn route_event(&mut self, event: Event) {
        self.inbox.push_back(event);
    }

    /// Drain the inbox: run action invocations, honour control commands.
    pub(crate) fn process_events(&mut self) {
        while let Some(event) = self.inbox.pop_front() {
            match event.body {
                EventBody::Action(action) => self.invoke(action, event.caller),
                EventBody::Control { command } => match command {
                    ControlCommand::Start => self.available = true,
                    ControlCommand::Stop | ControlCommand::Pause => self.available = false,
                },
                other => {
                    tracing::debug!(
                        service = %self.handle,
                        kind = other.kind(),
                        "Service ignoring event"
                    );
                }
            }
        }
    }

    pub(crate) fn run(&mut self) {}

    fn invoke(&mut self, action: ActionEvent, caller: Option<BusAddress>) {
        let Some(handler) = self.handlers.get(&action.name).cloned() else {
            tracing::warn!(service = %self.handle, action = %action.name, "No handler for routed action");
            self.complete(&action, caller, ActionStatus::Failed, None);
            return;
        };

        let reply_schema = {
            let registries = self.shared.registries.read();
            registries
                .actions
                .get(&action.name)
                .and_then(|def| def.reply_schema.clone())
                .and_then(|name| registries.schemas.get(&name).cloned())
        };
        let mut reply = reply_schema
            .map(|schema| schema.instantiate())
            .unwrap_or_else(|| Message::new(format!("{} Reply", action.name)));

        let handle = action.handle(
            caller
                .clone()
                .unwrap_or_else(|| self.address.clone()),
        );
        let mut ctx = ActionContext {
            beliefs: &mut self.beliefs,
            request: &action.request,
            reply: &mut reply,
            handle: &handle,
        };

        match handler(&mut ctx) {
            ActionResult::Success => {
                self.complete(&action, caller, ActionStatus::Success, Some(reply))
            }
            ActionResult::Failed => {
                self.complete(&action, caller, ActionStatus::Failed, Some(reply))
            }
            ActionResult::Pending => {}
        }
    }

    fn complete(
        &self,
        action: &ActionEvent,
        caller: Option<BusAddress>,
        status: ActionStatus,
        reply: Option<Message>,
    ) {
        let recipient = match (&action.remote_requester, caller) {
            (Some(remote), _) => remote.clone(),
            (None, Some(caller)) => caller,
            (None, None) => {
                tracing::warn!(service = %self.handle, action = %action.name, "Action completion has no recipient");
                return;
            }
        };
        self.shared.queue.push(
            Event::to(
                EventBody::ActionComplete {
                    intention_id: action.intention_id,
                    task_id: action.task_id,
                    status,
                    reply,
                },
                recipient,
            )
            .from(self.address.clone()),
        );
    }
}
