use crate::DBService;

pub(crate) async fn setup_test_db() -> DBService {
    DBService::new_in_memory()
        .await
        .expect("failed to open sqlite memory db")
}
