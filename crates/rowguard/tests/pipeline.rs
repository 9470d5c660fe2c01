//! End-to-end enforcement through `EntityOperations` and the in-memory provider

use std::sync::Arc;

use rowguard::{
    AccessControlEntry, AccessControlList, AccessControlRegistry, AccessValue, Acr,
    AuthenticationMethod, AuthorizationContext, Entity, EntityMetadata, EntityOperations, Error,
    Filter, FilterOutcome, InMemoryProvider, JwtClaims, MetadataRegistry, MfaOperation,
    MultiFactorAuthentication, MultiFactorAuthenticationRule, Pagination, RegisterOptions,
    RelationshipKind, Result, Selection, UserProfile, set_authorization_context,
    with_authorization_context,
};
use serde_json::{Value, json};

fn entity(value: Value) -> Entity {
    value.as_object().cloned().unwrap()
}

fn own_posts() -> AccessValue {
    AccessValue::conditional(|ctx: AuthorizationContext| async move {
        let id = ctx.user_id().unwrap_or_default().to_string();
        Ok::<_, anyhow::Error>(FilterOutcome::Filter(Filter::eq("authorId", id)))
    })
}

struct Blog {
    provider: Arc<InMemoryProvider>,
    operations: EntityOperations,
}

fn blog(provider: InMemoryProvider, mfa: Option<MultiFactorAuthentication>) -> Blog {
    let provider = Arc::new(provider.with_entity("Post", "id").with_entity("User", "id"));
    provider
        .seed(
            "Post",
            [
                entity(json!({"id": 1, "title": "first", "authorId": "alice", "draftNotes": "a"})),
                entity(json!({"id": 2, "title": "second", "authorId": "bob", "draftNotes": "b"})),
            ],
        )
        .unwrap();
    provider
        .seed(
            "User",
            [
                entity(json!({"id": "alice", "name": "Alice", "salary": 10})),
                entity(json!({"id": "bob", "name": "Bob", "salary": 20})),
            ],
        )
        .unwrap();

    let metadata = MetadataRegistry::new()
        .with_entity(
            EntityMetadata::new("Post", "id")
                .scalar("title", "String")
                .scalar("authorId", "String")
                .scalar("draftNotes", "String")
                .related("author", "User", RelationshipKind::ManyToOne)
                .with_provider(provider.clone()),
        )
        .with_entity(
            EntityMetadata::new("User", "id")
                .scalar("name", "String")
                .scalar("salary", "Int")
                .with_provider(provider.clone()),
        )
        .with_entity(EntityMetadata::new("Audit", "id").with_provider(provider.clone()));

    let mut registry = AccessControlRegistry::new("ADMINISTRATOR", Arc::new(metadata));
    registry
        .register_access_control_list(
            "Post",
            AccessControlList::new()
                .role(
                    "reader",
                    AccessControlEntry::new()
                        .read(true)
                        .restrict_fields(["draftNotes"]),
                )
                .role(
                    "author",
                    AccessControlEntry::new().read(true).write(own_posts()),
                )
                .role("contributor", AccessControlEntry::new().read(own_posts())),
            RegisterOptions::default(),
        )
        .unwrap();
    registry
        .register_access_control_list(
            "User",
            AccessControlList::new()
                .role(
                    "reader",
                    AccessControlEntry::new()
                        .read(true)
                        .restrict_fields(["salary"]),
                )
                .role("author", AccessControlEntry::new().read(true)),
            RegisterOptions::default(),
        )
        .unwrap();
    if let Some(mfa) = mfa {
        registry
            .register_multi_factor_authentication("Post", mfa, RegisterOptions::default())
            .unwrap();
    }

    Blog {
        provider,
        operations: EntityOperations::new(Arc::new(registry)),
    }
}

async fn as_caller<F, T>(context: AuthorizationContext, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_authorization_context(async move {
        set_authorization_context(context)?;
        work.await
    })
    .await
}

fn caller(id: &str, roles: &[&str]) -> AuthorizationContext {
    AuthorizationContext::for_user(UserProfile::new(
        id,
        roles.iter().map(ToString::to_string).collect(),
    ))
}

fn title(row: &Entity) -> &str {
    row.get("title").and_then(Value::as_str).unwrap_or_default()
}

#[tokio::test]
async fn test_read_is_unconditional_when_any_role_grants_it() {
    let blog = blog(InMemoryProvider::default(), None);

    let rows = as_caller(
        caller("alice", &["reader", "author"]),
        blog.operations
            .find("Post", Filter::empty(), Pagination::default(), Selection::fields(["title"])),
    )
    .await
    .unwrap();

    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_conditional_read_returns_only_callers_rows() {
    let blog = blog(InMemoryProvider::default(), None);

    let rows = as_caller(
        caller("bob", &["contributor"]),
        blog.operations
            .find("Post", Filter::empty(), Pagination::default(), Selection::fields(["title"])),
    )
    .await
    .unwrap();
    let titles: Vec<&str> = rows.iter().map(title).collect();
    assert_eq!(titles, ["second"]);

    let hidden = as_caller(
        caller("bob", &["contributor"]),
        blog.operations
            .find_one("Post", Filter::eq("id", 1), Selection::fields(["title"])),
    )
    .await
    .unwrap();
    assert!(hidden.is_none());

    let rows = as_caller(
        caller("carol", &["contributor"]),
        blog.operations
            .find("Post", Filter::empty(), Pagination::default(), Selection::fields(["title"])),
    )
    .await
    .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_caller_filter_is_combined_with_access_filter() {
    let blog = blog(InMemoryProvider::default(), None);

    let deleted = as_caller(
        caller("alice", &["author"]),
        blog.operations.delete_one("Post", Filter::eq("id", 2)),
    )
    .await
    .unwrap();
    assert!(deleted.is_none());
    assert_eq!(blog.provider.rows("Post").len(), 2);

    let deleted = as_caller(
        caller("alice", &["author"]),
        blog.operations.delete_one("Post", Filter::eq("id", 1)),
    )
    .await
    .unwrap();
    assert_eq!(deleted.as_ref().map(title), Some("first"));
}

#[tokio::test]
async fn test_no_roles_is_forbidden() {
    let blog = blog(InMemoryProvider::default(), None);

    let err = as_caller(
        caller("mallory", &[]),
        blog.operations
            .find_one("Post", Filter::eq("id", 1), Selection::fields(["title"])),
    )
    .await
    .unwrap_err();
    assert!(err.is_forbidden());
}

#[tokio::test]
async fn test_entity_without_acl_is_denied() {
    let blog = blog(InMemoryProvider::default(), None);

    let err = as_caller(
        caller("alice", &["ADMINISTRATOR"]),
        blog.operations
            .find("Audit", Filter::empty(), Pagination::default(), Selection::new()),
    )
    .await
    .unwrap_err();
    assert!(err.is_forbidden());
}

#[tokio::test]
async fn test_operations_require_a_request_scope() {
    let blog = blog(InMemoryProvider::default(), None);
    let err = blog
        .operations
        .find("Post", Filter::empty(), Pagination::default(), Selection::new())
        .await
        .unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn test_restricted_field_in_nested_selection() {
    let blog = blog(InMemoryProvider::default(), None);

    let err = as_caller(
        caller("alice", &["reader"]),
        blog.operations.find(
            "Post",
            Filter::empty(),
            Pagination::default(),
            Selection::fields(["title"]).nested("author", Selection::fields(["name", "salary"])),
        ),
    )
    .await
    .unwrap_err();

    assert!(err.is_restricted_field());
    assert_eq!(err.to_string(), "cannot query field \"salary\" on type \"User\"");
}

#[tokio::test]
async fn test_create_outside_filter_rolls_back() {
    let blog = blog(InMemoryProvider::default(), None);

    let err = as_caller(
        caller("alice", &["author"]),
        blog.operations.create(
            "Post",
            vec![
                entity(json!({"title": "mine", "authorId": "alice"})),
                entity(json!({"title": "forged", "authorId": "bob"})),
            ],
            Selection::fields(["id"]),
        ),
    )
    .await
    .unwrap_err();

    assert!(err.is_forbidden());
    let titles: Vec<String> = blog
        .provider
        .rows("Post")
        .iter()
        .map(|row| title(row).to_string())
        .collect();
    assert_eq!(titles, ["first", "second"]);
}

#[tokio::test]
async fn test_create_inside_filter_commits() {
    let blog = blog(InMemoryProvider::default(), None);

    let created = as_caller(
        caller("alice", &["author"]),
        blog.operations.create_one(
            "Post",
            entity(json!({"title": "third", "authorId": "alice"})),
            Selection::fields(["id"]),
        ),
    )
    .await
    .unwrap();

    assert!(created.get("id").is_some_and(Value::is_number));
    assert_eq!(blog.provider.rows("Post").len(), 3);
}

#[tokio::test]
async fn test_row_filter_requires_transactional_provider() {
    let blog = blog(InMemoryProvider::new("kv").without_transactions(), None);

    let err = as_caller(
        caller("alice", &["author"]),
        blog.operations.create_one(
            "Post",
            entity(json!({"title": "third", "authorId": "alice"})),
            Selection::new(),
        ),
    )
    .await
    .unwrap_err();

    assert!(err.is_config());
    assert_eq!(blog.provider.rows("Post").len(), 2);
}

#[tokio::test]
async fn test_update_of_row_outside_filter_is_rejected_before_write() {
    let blog = blog(InMemoryProvider::default(), None);

    let err = as_caller(
        caller("alice", &["author"]),
        blog.operations.update_one(
            "Post",
            entity(json!({"id": 2, "title": "hijacked", "authorId": "alice"})),
            Selection::new(),
        ),
    )
    .await
    .unwrap_err();

    assert!(err.is_forbidden());
    let rows = blog.provider.rows("Post");
    assert_eq!(title(&rows[1]), "second");
}

#[tokio::test]
async fn test_update_moving_row_out_of_filter_rolls_back() {
    let blog = blog(InMemoryProvider::default(), None);

    let err = as_caller(
        caller("alice", &["author"]),
        blog.operations.update_one(
            "Post",
            entity(json!({"id": 1, "title": "given away", "authorId": "bob"})),
            Selection::new(),
        ),
    )
    .await
    .unwrap_err();

    assert!(err.is_forbidden());
    let rows = blog.provider.rows("Post");
    assert_eq!(title(&rows[0]), "first");
    assert_eq!(rows[0]["authorId"], "alice");
}

#[tokio::test]
async fn test_nested_write_without_grant_rejects_whole_operation() {
    let blog = blog(InMemoryProvider::default(), None);

    let err = as_caller(
        caller("alice", &["author"]),
        blog.operations.update_one(
            "Post",
            entity(json!({
                "id": 1,
                "title": "renamed",
                "author": {"id": "alice", "name": "Queen Alice"}
            })),
            Selection::new(),
        ),
    )
    .await
    .unwrap_err();

    assert!(err.is_forbidden());
    assert_eq!(title(&blog.provider.rows("Post")[0]), "first");
    assert_eq!(blog.provider.rows("User")[0]["name"], "Alice");
}

#[tokio::test]
async fn test_connecting_existing_related_row_needs_only_read() {
    let blog = blog(InMemoryProvider::default(), None);

    let updated = as_caller(
        caller("alice", &["author"]),
        blog.operations.update_one(
            "Post",
            entity(json!({"id": 1, "title": "renamed", "author": {"id": "alice"}})),
            Selection::new(),
        ),
    )
    .await
    .unwrap();

    assert_eq!(title(&updated), "renamed");
}

fn otp_for_create() -> MultiFactorAuthentication {
    MultiFactorAuthentication::new().rule(
        "author",
        MfaOperation::Create,
        MultiFactorAuthenticationRule::new(1, vec![AuthenticationMethod::OneTimePassword]),
    )
}

fn claims(acr: Acr) -> JwtClaims {
    let now = rowguard::token::now_epoch_seconds();
    JwtClaims {
        sub: "alice".to_string(),
        iat: now,
        exp: now + 3600,
        amr: vec![AuthenticationMethod::Password],
        acr,
        username: None,
    }
}

#[tokio::test]
async fn test_create_without_fresh_factor_is_challenged() {
    let blog = blog(InMemoryProvider::default(), Some(otp_for_create()));
    let context = caller("alice", &["author"]).with_claims(claims(Acr::default()));

    let err = as_caller(
        context,
        blog.operations.create_one(
            "Post",
            entity(json!({"title": "third", "authorId": "alice"})),
            Selection::new(),
        ),
    )
    .await
    .unwrap_err();

    match err {
        Error::Challenge { providers, .. } => {
            assert_eq!(providers, [AuthenticationMethod::OneTimePassword]);
        }
        other => panic!("expected challenge, got {other:?}"),
    }
    assert_eq!(blog.provider.rows("Post").len(), 2);
}

#[tokio::test]
async fn test_create_with_fresh_factor_passes() {
    let blog = blog(InMemoryProvider::default(), Some(otp_for_create()));
    let mut acr = Acr::default();
    acr.values.insert(
        AuthenticationMethod::OneTimePassword,
        rowguard::token::now_epoch_seconds() + 60,
    );
    let context = caller("alice", &["author"]).with_claims(claims(acr));

    as_caller(
        context,
        blog.operations.create_one(
            "Post",
            entity(json!({"title": "third", "authorId": "alice"})),
            Selection::new(),
        ),
    )
    .await
    .unwrap();

    let reads = as_caller(
        caller("alice", &["author"]).with_claims(claims(Acr::default())),
        blog.operations
            .find("Post", Filter::empty(), Pagination::default(), Selection::new()),
    )
    .await
    .unwrap();
    assert_eq!(reads.len(), 3);
}

#[tokio::test]
async fn test_concurrent_requests_are_isolated() {
    let blog = Arc::new(blog(InMemoryProvider::default(), None));

    let tasks = ["alice", "bob"].map(|user| {
        let blog = Arc::clone(&blog);
        tokio::spawn(async move {
            as_caller(caller(user, &["author"]), async {
                tokio::task::yield_now().await;
                let rows = blog
                    .operations
                    .find("Post", Filter::empty(), Pagination::default(), Selection::new())
                    .await?;
                let deleted = blog
                    .operations
                    .delete_one("Post", Filter::empty())
                    .await?;
                Ok::<_, Error>((rows.len(), deleted.and_then(|row| row.get("authorId").cloned())))
            })
            .await
        })
    });

    let [alice, bob] = tasks;
    let (alice_rows, alice_deleted) = alice.await.unwrap().unwrap();
    let (bob_rows, bob_deleted) = bob.await.unwrap().unwrap();

    assert!(alice_rows >= 1 && bob_rows >= 1);
    assert_eq!(alice_deleted, Some(json!("alice")));
    assert_eq!(bob_deleted, Some(json!("bob")));
    assert!(blog.provider.rows("Post").is_empty());
}
