use rust_decimal::Decimal;

/// Capital-protection limits checked by the gate after the kill switch and
/// circuit breaker.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Max fraction of a bucket's daily cap a single allocation may take.
    pub max_allocation_share: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskViolation {
    AllocationOverShare { share_limit: Decimal, cap: Decimal },
}

impl RiskLimits {
    /// `daily_cap` is `None` when the bucket has no configured cap; the vault
    /// denies those as unknown, so there is nothing to evaluate against here.
    pub fn evaluate(&self, amount: Decimal, daily_cap: Option<Decimal>) -> Result<(), RiskViolation> {
        if let Some(cap) = daily_cap {
            if cap > Decimal::ZERO && amount > cap * self.max_allocation_share {
                return Err(RiskViolation::AllocationOverShare {
                    share_limit: self.max_allocation_share,
                    cap,
                });
            }
        }
        Ok(())
    }
}
