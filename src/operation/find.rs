use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    channel::{Command, Response},
    cluster::Cluster,
    error::Result,
    executor::execute_read_operation,
    operation::{check_success, Operation, Retryability},
    selection_criteria::SelectionCriteria,
    session::SessionHandle,
};

/// Reads the documents of a collection matching a filter.
#[derive(Debug)]
pub struct Find {
    collection: String,
    filter: Value,
    criteria: Option<SelectionCriteria>,
}

impl Find {
    /// Creates a find operation over the given collection.
    pub fn new(
        collection: impl Into<String>,
        filter: Value,
        criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            collection: collection.into(),
            filter,
            criteria,
        }
    }

    /// Executes this find on the given cluster, returning the matching documents.
    pub async fn execute(
        mut self,
        cluster: &Cluster,
        session: &SessionHandle,
    ) -> Result<Vec<Value>> {
        execute_read_operation(&mut self, cluster, session).await
    }
}

#[derive(Debug, Deserialize)]
struct FindBody {
    #[serde(default)]
    documents: Vec<Value>,
}

impl Operation for Find {
    type O = Vec<Value>;

    const NAME: &'static str = "find";

    fn build(&mut self) -> Result<Command> {
        let body = json!({
            Self::NAME: self.collection,
            "filter": self.filter,
        });
        Ok(Command::new(Self::NAME, body))
    }

    fn handle_response(&self, response: Response) -> Result<Self::O> {
        check_success(&response)?;
        let body: FindBody = response.body_as()?;
        Ok(body.documents)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.criteria.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_includes_filter() {
        let mut find = Find::new("users", json!({ "age": { "$gt": 21 } }), None);
        let command = find.build().unwrap();
        assert_eq!(command.name, "find");
        assert_eq!(command.body["find"], "users");
        assert_eq!(command.body["filter"]["age"]["$gt"], 21);
    }

    #[test]
    fn response_documents_are_returned() {
        let find = Find::new("users", json!({}), None);
        let response = Response::new(json!({
            "ok": 1,
            "documents": [{ "_id": 1 }, { "_id": 2 }],
        }));
        let documents = find.handle_response(response).unwrap();
        assert_eq!(documents.len(), 2);
    }
}
