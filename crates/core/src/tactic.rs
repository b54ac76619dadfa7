use std::fmt;

/// Policy for picking between the candidate plans of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanOrder {
    /// Consider every candidate; the planner ranks them by cost.
    #[default]
    ChooseBestPlan,
    /// A plan attempted in the current loop iteration is excluded until
    /// the whole set has been tried, then the set resets.
    ExcludePlanAfterAttempt,
    /// The fixed plan list is executed in declared order.
    Strict,
}

impl fmt::Display for PlanOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanOrder::ChooseBestPlan => "ChooseBestPlan",
            PlanOrder::ExcludePlanAfterAttempt => "ExcludePlanAfterAttempt",
            PlanOrder::Strict => "Strict",
        };
        write!(f, "{s}")
    }
}

pub const LOOP_PLANS_INFINITELY: u32 = u32::MAX;

/// A plan-selection policy for one goal.
#[derive(Debug, Clone)]
pub struct Tactic {
    pub name: String,
    pub goal_name: String,
    /// Explicit plan list; empty means every plan handling the goal.
    pub plans: Vec<String>,
    pub plan_order: PlanOrder,
    /// How many passes over the plan set the goal may make before it is
    /// considered exhausted.
    pub loop_plans_count: u32,
    /// True when `plans` is an authored list rather than the open set.
    pub uses_plan_list: bool,
}

impl Tactic {
    pub fn new(name: impl Into<String>, goal_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            goal_name: goal_name.into(),
            plans: Vec::new(),
            plan_order: PlanOrder::default(),
            loop_plans_count: 1,
            uses_plan_list: false,
        }
    }

    pub fn loops_forever(&self) -> bool {
        self.loop_plans_count == LOOP_PLANS_INFINITELY
    }

    /// Deduplicate the plan list; ChooseBestPlan treats it as a set.
    pub fn normalise(&mut self) {
        if self.plan_order == PlanOrder::ChooseBestPlan {
            let mut seen = std::collections::HashSet::new();
            self.plans.retain(|p| seen.insert(p.clone()));
        }
    }
}

/// Name of the tactic auto-created for each committed goal.
pub fn builtin_tactic_name(goal: &str) -> String {
    format!("{goal} Builtin Tactic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_best_plan_dedupes_on_normalise() {
        let mut tactic = Tactic::new("T", "G");
        tactic.plans = vec!["A".into(), "B".into(), "A".into()];
        tactic.normalise();
        assert_eq!(tactic.plans, vec!["A".to_string(), "B".to_string()]);

        let mut strict = Tactic::new("S", "G");
        strict.plan_order = PlanOrder::Strict;
        strict.plans = vec!["A".into(), "A".into()];
        strict.normalise();
        assert_eq!(strict.plans.len(), 2, "strict lists keep duplicates");
    }

    #[test]
    fn builtin_name_is_stable() {
        assert_eq!(builtin_tactic_name("Solve"), "Solve Builtin Tactic");
    }
}
