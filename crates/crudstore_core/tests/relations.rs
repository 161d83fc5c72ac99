use crudstore_core::{
    EntryState, InMemoryAdapter, Join, Predicate, StoreError, UnitOfWork,
};
use std::rc::Rc;

#[derive(Debug, Clone, Default, PartialEq)]
struct Author {
    id: i64,
    name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Post {
    id: i64,
    author_id: i64,
    title: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Comment {
    id: i64,
    post_id: i64,
    body: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Tag {
    id: i64,
    label: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PostTag {
    post_id: i64,
    tag_id: i64,
}

crudstore_core::entity_fields!(Author as "author" => [id, name]);
crudstore_core::entity_fields!(Post as "post" => [id, author_id, title]);
crudstore_core::entity_fields!(Comment as "comment" => [id, post_id, body]);
crudstore_core::entity_fields!(Tag as "tag" => [id, label]);
crudstore_core::entity_fields!(PostTag as "post_tag" => [post_id, tag_id]);

fn post(id: i64, author_id: i64, title: &str) -> Post {
    Post {
        id,
        author_id,
        title: title.to_string(),
    }
}

fn comment(id: i64, post_id: i64, body: &str) -> Comment {
    Comment {
        id,
        post_id,
        body: body.to_string(),
    }
}

fn tag(id: i64, label: &str) -> Tag {
    Tag {
        id,
        label: label.to_string(),
    }
}

fn link(post_id: i64, tag_id: i64) -> PostTag {
    PostTag { post_id, tag_id }
}

struct Blog {
    uow: UnitOfWork,
    authors: Rc<InMemoryAdapter<Author>>,
    comments: Rc<InMemoryAdapter<Comment>>,
    tags: Rc<InMemoryAdapter<Tag>>,
    post_tags: Rc<InMemoryAdapter<PostTag>>,
}

fn blog() -> Blog {
    let authors = Rc::new(InMemoryAdapter::new(&["id"]).with_rows([Author {
        id: 1,
        name: "ada".to_string(),
    }]));
    let posts = Rc::new(
        InMemoryAdapter::new(&["id"]).with_rows([post(1, 1, "first"), post(2, 1, "second")]),
    );
    let comments = Rc::new(InMemoryAdapter::new(&["id"]).with_rows([
        comment(1, 1, "great read"),
        comment(2, 1, "thanks"),
        comment(3, 2, "meh"),
    ]));
    let tags = Rc::new(InMemoryAdapter::new(&["id"]).with_rows([tag(10, "rust"), tag(11, "db")]));
    let post_tags = Rc::new(
        InMemoryAdapter::new(&["post_id", "tag_id"]).with_rows([
            link(1, 10),
            link(1, 11),
            link(2, 10),
        ]),
    );

    let mut uow = UnitOfWork::new();
    uow.register::<Post>(posts)
        .map_one::<Author>("author", Join::on("author_id", "id"))
        .map_many::<Comment>("comments", Join::on("id", "post_id"))
        .map_through::<Tag, PostTag>("tags", Join::on("id", "post_id"), Join::on("id", "tag_id"));
    uow.register::<Author>(authors.clone());
    uow.register::<Comment>(comments.clone());
    uow.register::<Tag>(tags.clone());
    uow.register::<PostTag>(post_tags.clone());
    Blog {
        uow,
        authors,
        comments,
        tags,
        post_tags,
    }
}

fn load_post(uow: &mut UnitOfWork, id: i64) -> crudstore_core::EntityRef<Post> {
    uow.find_single::<Post>(Predicate::eq("id", id))
        .unwrap()
        .unwrap()
}

#[test]
fn references_resolve_once_and_unmapped_fields_are_absent() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 1);

    let author = b.uow.reference::<Post, Author>(p, "author").unwrap().unwrap();
    assert_eq!(b.uow.get(author).unwrap().name, "ada");
    let again = b.uow.reference::<Post, Author>(p, "author").unwrap().unwrap();
    assert_eq!(author, again);
    assert_eq!(b.authors.read_count(), 1);

    assert!(b.uow.reference::<Post, Author>(p, "editor").unwrap().is_none());
}

#[test]
fn collections_defer_loading_until_enumerated() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 1);

    let collection = b.uow.collection::<Post, Comment>(p, "comments").unwrap().unwrap();
    assert!(!collection.is_loaded());
    assert_eq!(b.comments.read_count(), 0);

    let items = b.uow.load_collection::<Post, Comment>(p, "comments").unwrap();
    let bodies: Vec<_> = items
        .iter()
        .map(|item| b.uow.get(*item).unwrap().body.clone())
        .collect();
    assert_eq!(bodies, vec!["great read", "thanks"]);

    b.uow.load_collection::<Post, Comment>(p, "comments").unwrap();
    assert_eq!(b.comments.read_count(), 1);
}

#[test]
fn relation_shape_is_checked() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 1);

    assert!(matches!(
        b.uow.reference::<Post, Comment>(p, "comments"),
        Err(StoreError::RelationMismatch { .. })
    ));
    assert!(matches!(
        b.uow.load_collection::<Post, Author>(p, "tags"),
        Err(StoreError::RelationMismatch { .. })
    ));
    assert!(matches!(
        b.uow.assign_reference::<Post, Author>(p, "editor", None),
        Err(StoreError::RelationNotMapped { .. })
    ));
}

#[test]
fn many_to_many_collections_go_through_join_rows() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 2);

    let tags = b.uow.load_collection::<Post, Tag>(p, "tags").unwrap();
    let labels: Vec<_> = tags
        .iter()
        .map(|item| b.uow.get(*item).unwrap().label.clone())
        .collect();
    assert_eq!(labels, vec!["rust"]);
}

#[test]
fn removing_a_shared_tag_only_deletes_the_join_row() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 1);
    let tags = b.uow.load_collection::<Post, Tag>(p, "tags").unwrap();
    assert_eq!(tags.len(), 2);

    for item in &tags {
        assert!(b.uow.collection_remove(p, "tags", *item).unwrap());
    }
    let report = b.uow.commit().unwrap();

    assert_eq!(b.post_tags.rows(), vec![link(2, 10)]);
    assert_eq!(b.tags.rows(), vec![tag(10, "rust")]);
    assert_eq!(report.updated, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.committed[0].entity, tags[0].id());
    assert_eq!(report.committed[0].operation, EntryState::Modified);
}

#[test]
fn adding_a_stored_tag_inserts_a_join_row_and_updates_it() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 2);
    let db = b.uow.find_single::<Tag>(Predicate::eq("id", 11)).unwrap().unwrap();

    assert!(b.uow.collection_add(p, "tags", db).unwrap());
    assert!(!b.uow.collection_add(p, "tags", db).unwrap());
    let report = b.uow.commit().unwrap();

    assert!(b.post_tags.rows().contains(&link(2, 11)));
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(b.tags.len(), 2);
}

#[test]
fn adding_a_new_tag_creates_it_before_the_join_row() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 1);
    let fresh = b.uow.attach(tag(12, "new")).unwrap();

    b.uow.collection_add(p, "tags", fresh).unwrap();
    let report = b.uow.commit().unwrap();

    assert_eq!(report.created, 1);
    assert!(b.tags.rows().contains(&tag(12, "new")));
    assert!(b.post_tags.rows().contains(&link(1, 12)));
}

#[test]
fn assigned_collections_are_reconciled_against_storage() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 1);
    let kept = b
        .uow
        .find_single::<Comment>(Predicate::eq("id", 2))
        .unwrap()
        .unwrap();
    let fresh = b.uow.attach(comment(4, 0, "fresh")).unwrap();

    b.uow.assign_collection(p, "comments", [kept, fresh]).unwrap();
    b.uow.mark_modified(p).unwrap();
    let report = b.uow.commit().unwrap();

    let ops: Vec<_> = report.committed.iter().map(|entry| entry.operation).collect();
    assert_eq!(
        ops,
        vec![EntryState::New, EntryState::Modified, EntryState::Deleted]
    );
    assert_eq!(
        b.comments.rows(),
        vec![comment(2, 1, "thanks"), comment(3, 2, "meh"), comment(4, 1, "fresh")]
    );
}

#[test]
fn navigation_predicates_filter_on_related_rows() {
    let mut b = blog();

    let tagged = b
        .uow
        .find::<Post>(Predicate::related("tags", Predicate::eq("label", "db")))
        .load(&mut b.uow)
        .unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(b.uow.get(tagged[0]).unwrap().id, 1);

    let praised = b
        .uow
        .find::<Post>(Predicate::True)
        .filter(Predicate::related("comments", Predicate::contains("body", "meh")))
        .load(&mut b.uow)
        .unwrap();
    assert_eq!(praised.len(), 1);
    assert_eq!(b.uow.get(praised[0]).unwrap().title, "second");
}

#[test]
fn registration_and_mapping_are_first_wins() {
    let mut b = blog();
    b.uow.register::<Post>(Rc::new(InMemoryAdapter::new(&["id"])));
    b.uow
        .map::<Post>()
        .map_many::<Comment>("comments", Join::on("author_id", "post_id"));

    let p = load_post(&mut b.uow, 2);
    let items = b.uow.load_collection::<Post, Comment>(p, "comments").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(b.uow.get(items[0]).unwrap().body, "meh");
}

#[test]
fn resolve_navigation_fills_every_relation() {
    let mut b = blog();
    let p = load_post(&mut b.uow, 1);

    b.uow.resolve_navigation(p).unwrap();
    let reads = (b.authors.read_count(), b.comments.read_count(), b.tags.read_count());
    assert_eq!(reads, (1, 1, 1));

    b.uow.reference::<Post, Author>(p, "author").unwrap();
    b.uow.load_collection::<Post, Tag>(p, "tags").unwrap();
    assert_eq!(b.authors.read_count(), 1);
    assert_eq!(b.tags.read_count(), 1);
    assert_eq!(b.uow.pending_count(), 0);
}
