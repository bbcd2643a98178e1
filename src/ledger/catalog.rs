//! Operator and task catalog.
//!
//! One entry per counter the reporting sheet knows about. The `label` is the
//! exact column header on the remote sheet, so renames here are breaking.

use crate::ledger::TaskKey;

pub struct TaskDef {
    /// Task name part of the storage key.
    pub id: &'static str,
    /// Column header in the shift report sheet.
    pub label: &'static str,
}

pub struct OperatorDef {
    /// Operator prefix of the storage key.
    pub id: &'static str,
    /// Operator name as written into task log rows.
    pub name: &'static str,
    pub tasks: &'static [TaskDef],
}

const fn task(id: &'static str, label: &'static str) -> TaskDef {
    TaskDef { id, label }
}

pub const OPERATORS: &[OperatorDef] = &[
    OperatorDef {
        id: "lime",
        name: "Lime",
        tasks: &[
            task("collectTroti", "Collect Lime"),
            task("rebalanceTroti", "Rebalance Lime"),
            task("missingTroti", "Missing Lime"),
            task("collectBike", "Collect Bike Lime"),
            task("rebalanceBike", "Rebalance Bike Lime"),
            task("missingBike", "Missing Bike Lime"),
        ],
    },
    OperatorDef {
        id: "ridemovi",
        name: "Ridemovi",
        tasks: &[
            task("deploy", "Deploy Ridemovi"),
            task("collect", "Collect Ridemovi"),
            task("rebalance", "Rebalance Ridemovi"),
            task("swap", "Swap Ridemovi"),
            task("swapRebalance", "Swap Rebalance Ridemovi"),
            task("reparking", "Reparking Ridemovi"),
            task("specialRecovery", "Special Recovery Ridemovi"),
            task("outsideFixed", "Outside Fixed Ridemovi"),
            task("outsideFixedSwap", "Outside Fixed Swap Ridemovi"),
            task(
                "outsideFixedSwapRebalance",
                "Outside Fixed Swap Rebalance Ridemovi",
            ),
            task("missing", "Missing Ridemovi"),
        ],
    },
    OperatorDef {
        id: "bird",
        name: "Bird",
        tasks: &[
            task("deploy", "Deploy Bird"),
            task("collect", "Collect Bird"),
            task("rebalance", "Rebalance Bird"),
            task("rebalanceVirtual", "Rebalance Virtual Bird"),
            task("missing", "Missing Bird"),
            task("collectEBike", "Collect Bird EBike"),
            task("rebalanceEBike", "Rebalance Bird EBike"),
            task("swapEBike", "Swap Bird EBike"),
            task("missingEBike", "Missing Bird EBike"),
        ],
    },
    OperatorDef {
        id: "link",
        name: "Link",
        tasks: &[
            task("deploy", "Deploy Link"),
            task("collect", "Collect Link"),
            task("rebalance", "Rebalance Link"),
            task("missing", "Missing Link"),
        ],
    },
    OperatorDef {
        id: "bolt",
        name: "Bolt",
        tasks: &[
            task("deploy", "Deploy Bolt"),
            task("collect", "Collect Bolt"),
            task("rebalance", "Rebalance Bolt"),
            task("swap", "Swap Bolt"),
            task("missing", "Missing Bolt"),
        ],
    },
    OperatorDef {
        id: "delivery",
        name: "Delivery",
        tasks: &[task("entregas", "Total Entregas")],
    },
    OperatorDef {
        id: "mechanic",
        name: "Mecânico",
        tasks: &[
            task("trotinetesReparadas", "Trotinetes Reparadas"),
            task("bicicletasReparadas", "Bicicletas Reparadas"),
        ],
    },
];

pub fn find_operator(id: &str) -> Option<&'static OperatorDef> {
    OPERATORS.iter().find(|op| op.id == id)
}

/// Resolves a task key against the catalog, rejecting counters the report
/// sheet has no column for.
pub fn resolve(key: &TaskKey) -> Option<(&'static OperatorDef, &'static TaskDef)> {
    let operator = find_operator(&key.operator)?;
    let task = operator.tasks.iter().find(|t| t.id == key.task)?;
    Some((operator, task))
}
