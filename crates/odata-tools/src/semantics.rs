//! MCP tool annotations derived from operation semantics.

use crate::catalog::OperationKind;
use rmcp::model::ToolAnnotations;

/// Generate MCP tool annotations for an operation kind.
///
/// `openWorldHint` is always `true`: every operation talks to a remote service.
#[must_use]
pub fn annotations_for_kind(kind: OperationKind) -> ToolAnnotations {
    let open_world_hint = Some(true);

    match kind {
        OperationKind::Read
        | OperationKind::List
        | OperationKind::Search
        | OperationKind::Count
        | OperationKind::NavigateGet => ToolAnnotations {
            title: None,
            read_only_hint: Some(true),
            destructive_hint: Some(false),
            idempotent_hint: Some(true),
            open_world_hint,
        },
        OperationKind::Create => ToolAnnotations {
            title: None,
            read_only_hint: Some(false),
            destructive_hint: Some(false),
            idempotent_hint: Some(false),
            open_world_hint,
        },
        // PATCH with the same body converges on the same state.
        OperationKind::Update => ToolAnnotations {
            title: None,
            read_only_hint: Some(false),
            destructive_hint: Some(true),
            idempotent_hint: Some(true),
            open_world_hint,
        },
        OperationKind::Delete | OperationKind::NavigateRemove => ToolAnnotations {
            title: None,
            read_only_hint: Some(false),
            destructive_hint: Some(true),
            idempotent_hint: Some(true),
            open_world_hint,
        },
        OperationKind::NavigateAdd => ToolAnnotations {
            title: None,
            read_only_hint: Some(false),
            destructive_hint: Some(false),
            idempotent_hint: Some(true),
            open_world_hint,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::annotations_for_kind;
    use crate::catalog::OperationKind;

    #[test]
    fn every_kind_is_open_world() {
        for kind in OperationKind::ALL {
            assert_eq!(annotations_for_kind(kind).open_world_hint, Some(true));
        }
    }

    #[test]
    fn reads_are_readonly_and_idempotent() {
        for kind in [
            OperationKind::Read,
            OperationKind::List,
            OperationKind::Count,
            OperationKind::NavigateGet,
        ] {
            let a = annotations_for_kind(kind);
            assert_eq!(a.read_only_hint, Some(true));
            assert_eq!(a.destructive_hint, Some(false));
            assert_eq!(a.idempotent_hint, Some(true));
        }
    }

    #[test]
    fn create_is_not_idempotent_and_delete_is_destructive() {
        let create = annotations_for_kind(OperationKind::Create);
        assert_eq!(create.read_only_hint, Some(false));
        assert_eq!(create.idempotent_hint, Some(false));

        let delete = annotations_for_kind(OperationKind::Delete);
        assert_eq!(delete.destructive_hint, Some(true));
    }
}
