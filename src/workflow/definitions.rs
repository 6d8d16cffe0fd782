//! Built-in workflow stage graphs.

use serde_json::{Map, Value};

/// Where a stage's dispatch payloads come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    /// One dispatch with the workflow payload.
    Payload,
    /// One dispatch per element of the array at `list` in the previous
    /// stage's output; the element is placed at `item`.
    FanOut {
        list: &'static str,
        item: &'static str,
    },
    /// One dispatch whose `into` field collects `field` from each result of
    /// the previous fan-out stage, in order.
    Gather {
        field: &'static str,
        into: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StageDef {
    pub name: &'static str,
    pub function: &'static str,
    pub input: StageInput,
}

#[derive(Debug)]
pub struct WorkflowDef {
    pub name: &'static str,
    pub stages: &'static [StageDef],
}

pub const VIDEO: WorkflowDef = WorkflowDef {
    name: "video",
    stages: &[
        StageDef {
            name: "split",
            function: "video_split",
            input: StageInput::Payload,
        },
        StageDef {
            name: "transcode",
            function: "video_transcode",
            input: StageInput::FanOut {
                list: "split_files",
                item: "split_file",
            },
        },
        StageDef {
            name: "merge",
            function: "video_merge",
            input: StageInput::Gather {
                field: "transcoded_file",
                into: "transcoded_files",
            },
        },
    ],
};

pub const SVD: WorkflowDef = WorkflowDef {
    name: "svd",
    stages: &[
        StageDef {
            name: "start",
            function: "svd_start",
            input: StageInput::Payload,
        },
        StageDef {
            name: "compute",
            function: "svd_compute",
            input: StageInput::FanOut {
                list: "slices",
                item: "slice",
            },
        },
        StageDef {
            name: "merge",
            function: "svd_merge",
            input: StageInput::Gather {
                field: "result",
                into: "computed_slices",
            },
        },
    ],
};

static WORKFLOWS: [&WorkflowDef; 2] = [&VIDEO, &SVD];

pub fn lookup(name: &str) -> Option<&'static WorkflowDef> {
    WORKFLOWS.iter().copied().find(|w| w.name == name)
}

/// Workflow payload as an object. Anything else is carried under `input`.
pub fn base_payload(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

/// Dispatch payloads of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayloads {
    Single(Value),
    /// One payload per fan-out item, in item order.
    FanOut(Vec<Value>),
}

impl StageInput {
    /// Payloads to dispatch for this stage, given the workflow payload and
    /// the previous stage's output. `Err` names what is missing.
    pub fn payloads(
        &self,
        base: &Map<String, Value>,
        previous: Option<&Value>,
    ) -> Result<StagePayloads, String> {
        match self {
            StageInput::Payload => Ok(StagePayloads::Single(Value::Object(base.clone()))),
            StageInput::FanOut { list, item } => {
                let items = previous
                    .and_then(|p| p.get(*list))
                    .and_then(Value::as_array)
                    .ok_or_else(|| format!("previous stage output has no array `{}`", list))?;
                Ok(StagePayloads::FanOut(
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, value)| {
                            let mut payload = base.clone();
                            payload.insert(item.to_string(), value.clone());
                            payload.insert("item_index".to_string(), Value::from(index));
                            Value::Object(payload)
                        })
                        .collect(),
                ))
            }
            StageInput::Gather { field, into } => {
                let results = previous
                    .and_then(Value::as_array)
                    .ok_or_else(|| "previous stage produced no result list".to_string())?;
                let gathered = results
                    .iter()
                    .enumerate()
                    .map(|(index, result)| {
                        result
                            .get(*field)
                            .cloned()
                            .ok_or_else(|| format!("result {} has no `{}`", index, field))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let mut payload = base.clone();
                payload.insert(into.to_string(), Value::Array(gathered));
                Ok(StagePayloads::Single(Value::Object(payload)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("video").unwrap().stages.len(), 3);
        assert_eq!(lookup("svd").unwrap().stages[1].function, "svd_compute");
        assert!(lookup("unknown").is_none());
    }

    #[test]
    fn test_fan_out_payloads_are_indexed() {
        let base = base_payload(json!({"video": "in.mp4"}));
        let split_output = json!({"split_files": ["a.mp4", "b.mp4", "c.mp4"]});
        let payloads = StageInput::FanOut {
            list: "split_files",
            item: "split_file",
        }
        .payloads(&base, Some(&split_output))
        .unwrap();
        let StagePayloads::FanOut(payloads) = payloads else {
            panic!("expected fan-out payloads");
        };
        assert_eq!(payloads.len(), 3);
        assert_eq!(
            payloads[1],
            json!({"video": "in.mp4", "split_file": "b.mp4", "item_index": 1})
        );
    }

    #[test]
    fn test_gather_keeps_order() {
        let base = base_payload(json!({"row_num": 4}));
        let results = json!([{"result": "s0"}, {"result": "s1"}]);
        let payloads = StageInput::Gather {
            field: "result",
            into: "computed_slices",
        }
        .payloads(&base, Some(&results))
        .unwrap();
        assert_eq!(
            payloads,
            StagePayloads::Single(json!({"row_num": 4, "computed_slices": ["s0", "s1"]}))
        );
    }

    #[test]
    fn test_malformed_inputs() {
        let base = Map::new();
        let fan_out = StageInput::FanOut {
            list: "slices",
            item: "slice",
        };
        assert!(fan_out.payloads(&base, Some(&json!({"slices": 3}))).is_err());
        assert!(fan_out.payloads(&base, None).is_err());

        let gather = StageInput::Gather {
            field: "result",
            into: "computed_slices",
        };
        let err = gather
            .payloads(&base, Some(&json!([{"result": 1}, {"other": 2}])))
            .unwrap_err();
        assert!(err.contains("result 1"));
    }

    #[test]
    fn test_empty_fan_out() {
        let payloads = StageInput::FanOut {
            list: "slices",
            item: "slice",
        }
        .payloads(&Map::new(), Some(&json!({"slices": []})))
        .unwrap();
        assert_eq!(payloads, StagePayloads::FanOut(vec![]));
    }

    #[test]
    fn test_non_object_payload() {
        assert_eq!(
            Value::Object(base_payload(json!([1, 2]))),
            json!({"input": [1, 2]})
        );
        assert!(base_payload(Value::Null).is_empty());
    }
}
