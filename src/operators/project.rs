//! `project`/`select` (§4.3) — a specialized map that reshapes the value
//! according to a projection spec instead of an arbitrary closure.

use std::rc::Rc;

use serde_json::{Map, Value as Json};

use crate::error::Result;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::multiset::Multiset;
use crate::operators::Item;
use crate::value::Value;

/// One output column of a projection: a name and the path it reads from the
/// input row (or a literal, for `select { x: 1 }`-style constants).
#[derive(Debug, Clone)]
pub enum ProjectionField {
    Column { name: String, path: Vec<String> },
    Literal { name: String, value: Value },
}

/// A `select` clause: an ordered list of output columns. Unlike `map`, the
/// output shape is always a JSON object, which is what the spec's key-
/// stability invariant (§8 property 3) assumes of non-reshaping queries —
/// `project` is only used when `select` is actually present in the query.
pub fn project(graph: &mut Graph, input: StreamId, fields: Vec<ProjectionField>) -> StreamId {
    graph.add_operator(
        "project",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut acc = Multiset::new();
            for batch in &pulled[0] {
                for ((key, value), m) in downcast_batch::<Item>(batch).iter() {
                    let mut out = Map::new();
                    for field in &fields {
                        match field {
                            ProjectionField::Column { name, path } => {
                                out.insert(name.clone(), value.get_path(path).0);
                            }
                            ProjectionField::Literal { name, value } => {
                                out.insert(name.clone(), value.0.clone());
                            }
                        }
                    }
                    acc.push((key.clone(), Value(Json::Object(out))), *m);
                }
            }
            Ok(vec![erase_batch(acc)])
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::multiset::Multiplicity;
    use serde_json::json;

    #[test]
    fn project_reshapes_value_preserving_key() {
        let mut g = Graph::new();
        let input = g.add_input::<Item>();
        let out = project(
            &mut g,
            input.stream_id(),
            vec![ProjectionField::Column { name: "name".into(), path: vec!["name".into()] }],
        );
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        crate::operators::output::output(&mut g, out, move |b| {
            seen_clone.borrow_mut().extend(b.inner().to_vec());
        });
        input.send_data(
            &g,
            Multiset::singleton(
                (Key::from(1i64), Value(json!({"name": "Bob", "age": 30}))),
                Multiplicity::ONE,
            ),
        );
        g.run().unwrap();
        assert_eq!(seen.borrow()[0].0 .1, Value(json!({"name": "Bob"})));
        assert_eq!(seen.borrow()[0].0 .0, Key::from(1i64));
    }
}
