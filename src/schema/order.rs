//! Dependency ordering of tables
//!
//! Parents are created before their children and dropped after them. The
//! sort is stable: tables with no ordering constraint keep the order they
//! were declared in.

use super::{SyncSet, SyncTable};

impl SyncSet {
    /// Tables ordered parents first
    pub fn sort_by_dependencies(&self) -> Vec<&SyncTable> {
        let count = self.tables.len();
        let parents: Vec<Vec<usize>> = self
            .tables
            .iter()
            .enumerate()
            .map(|(index, table)| self.parent_indexes(index, table))
            .collect();

        let mut emitted = vec![false; count];
        let mut ordered = Vec::with_capacity(count);

        while ordered.len() < count {
            let ready = (0..count)
                .find(|&i| !emitted[i] && parents[i].iter().all(|&p| emitted[p]));

            let next = match ready {
                Some(index) => index,
                None => {
                    // Cycle: fall back to declaration order for what is left
                    let index = (0..count).find(|&i| !emitted[i]).unwrap_or(0);
                    tracing::warn!(
                        "Cyclic relation involving table {}, using declaration order",
                        self.tables[index].full_name()
                    );
                    index
                }
            };

            emitted[next] = true;
            ordered.push(&self.tables[next]);
        }

        ordered
    }

    /// Tables ordered children first
    pub fn reverse_dependency_order(&self) -> Vec<&SyncTable> {
        let mut ordered = self.sort_by_dependencies();
        ordered.reverse();
        ordered
    }

    /// Indexes of the tables the table at `index` references, self excluded
    fn parent_indexes(&self, index: usize, table: &SyncTable) -> Vec<usize> {
        let mut parents: Vec<usize> = self
            .relations
            .iter()
            .filter(|relation| {
                relation
                    .child
                    .matches(&table.table_name, table.schema_name.as_deref())
            })
            .filter_map(|relation| {
                self.tables
                    .iter()
                    .position(|t| {
                        t.matches(
                            &relation.parent.table_name,
                            relation.parent.schema_name.as_deref(),
                        )
                    })
            })
            .filter(|&parent| parent != index)
            .collect();
        parents.sort_unstable();
        parents.dedup();
        parents
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::{SyncColumn, SyncRelation, SyncSet, SyncTable, TableRef};

    fn table(name: &str) -> SyncTable {
        SyncTable::new(name).with_key_column(SyncColumn::new("Id", "int"))
    }

    fn relation(child: &str, parent: &str) -> SyncRelation {
        SyncRelation::new(
            format!("FK_{}_{}", child, parent),
            TableRef::new(child, None),
            TableRef::new(parent, None),
        )
        .with_keys(format!("{}Id", parent), "Id")
    }

    fn names(tables: Vec<&SyncTable>) -> Vec<&str> {
        tables.iter().map(|t| t.table_name.as_str()).collect()
    }

    #[test]
    fn test_child_declared_first_is_created_after_parent() {
        let set = SyncSet::new()
            .with_table(table("B"))
            .with_table(table("A"))
            .with_relation(relation("B", "A"));

        assert_eq!(names(set.sort_by_dependencies()), vec!["A", "B"]);
        assert_eq!(names(set.reverse_dependency_order()), vec!["B", "A"]);
    }

    #[test]
    fn test_chain_and_stable_order() {
        let set = SyncSet::new()
            .with_table(table("OrderLine"))
            .with_table(table("Log"))
            .with_table(table("Order"))
            .with_table(table("Customer"))
            .with_relation(relation("OrderLine", "Order"))
            .with_relation(relation("Order", "Customer"));

        assert_eq!(
            names(set.sort_by_dependencies()),
            vec!["Log", "Customer", "Order", "OrderLine"]
        );
    }

    #[test]
    fn test_self_reference_is_ignored() {
        let set = SyncSet::new()
            .with_table(table("Employee"))
            .with_relation(relation("Employee", "Employee"));

        assert_eq!(names(set.sort_by_dependencies()), vec!["Employee"]);
    }

    #[test]
    fn test_cycle_still_emits_every_table() {
        let set = SyncSet::new()
            .with_table(table("A"))
            .with_table(table("B"))
            .with_relation(relation("A", "B"))
            .with_relation(relation("B", "A"));

        assert_eq!(names(set.sort_by_dependencies()), vec!["A", "B"]);
    }

    #[test]
    fn test_relation_to_unknown_table_is_ignored() {
        let set = SyncSet::new()
            .with_table(table("Order"))
            .with_relation(relation("Order", "Customer"));

        assert_eq!(names(set.sort_by_dependencies()), vec!["Order"]);
    }
}
